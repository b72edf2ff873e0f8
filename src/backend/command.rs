//! Recorded GPU work.
//!
//! A [`CommandList`] is an ordered batch of commands submitted to a device in one
//! go. Commands hold strong references to every resource they touch, so dropping
//! the renderer-side handle of a resource (for example an uncompacted
//! acceleration structure) never frees memory a queued command still reads.

use std::sync::Arc;
use std::time::Duration;

use crate::backend::traits::{BackendError, SubmissionIndex};
use crate::backend::types::AccelerationStructureDescriptor;
use crate::resources::{
    AccelerationStructure, Buffer, ComputePipeline, IntersectionFunctionTable, Texture,
};

/// Resource bound to a kernel slot for one dispatch.
#[derive(Debug, Clone)]
pub enum Binding {
    UniformBuffer {
        buffer: Arc<Buffer>,
        offset: u64,
        size: u64,
    },
    StorageBuffer(Arc<Buffer>),
    AccelerationStructure(Arc<AccelerationStructure>),
    IntersectionFunctionTable(Arc<IntersectionFunctionTable>),
    /// Read-only texture
    Texture(Arc<Texture>),
    /// Write-only storage texture
    StorageTexture(Arc<Texture>),
}

/// Resource the kernel may reach indirectly, through a bindless address or a
/// BVH traversal, and that must therefore stay resident for the dispatch.
#[derive(Debug, Clone)]
pub enum ResidentResource {
    Buffer(Arc<Buffer>),
    AccelerationStructure(Arc<AccelerationStructure>),
}

#[derive(Debug, Clone)]
pub struct DispatchCommand {
    pub pipeline: Arc<ComputePipeline>,
    pub bindings: Vec<(u32, Binding)>,
    pub resident: Vec<ResidentResource>,
    /// Total threads in x and y
    pub grid: [u32; 2],
}

impl DispatchCommand {
    pub fn binding(&self, slot: u32) -> Option<&Binding> {
        self.bindings
            .iter()
            .find(|(index, _)| *index == slot)
            .map(|(_, binding)| binding)
    }

    /// Workgroups launched per axis for the pipeline's workgroup size.
    pub fn workgroups(&self) -> [u32; 2] {
        let [wx, wy] = self.pipeline.workgroup_size();
        [self.grid[0].div_ceil(wx), self.grid[1].div_ceil(wy)]
    }
}

#[derive(Debug, Clone)]
pub enum Command {
    BuildAccelerationStructure {
        descriptor: AccelerationStructureDescriptor,
        scratch: Arc<Buffer>,
        destination: Arc<AccelerationStructure>,
    },
    /// Write the compacted size of `source` as a little-endian `u64` at `offset`
    WriteCompactedSize {
        source: Arc<AccelerationStructure>,
        buffer: Arc<Buffer>,
        offset: u64,
    },
    CopyAndCompact {
        source: Arc<AccelerationStructure>,
        destination: Arc<AccelerationStructure>,
    },
    ClearTexture(Arc<Texture>),
    Dispatch(DispatchCommand),
    /// Bilinear resample of `source` to the size of `destination`
    Upscale {
        source: Arc<Texture>,
        destination: Arc<Texture>,
    },
    /// Copy `source` to `destination` with format conversion and nearest scaling
    Blit {
        source: Arc<Texture>,
        destination: Arc<Texture>,
    },
}

impl Command {
    pub fn name(&self) -> &'static str {
        match self {
            Command::BuildAccelerationStructure { .. } => "build_acceleration_structure",
            Command::WriteCompactedSize { .. } => "write_compacted_size",
            Command::CopyAndCompact { .. } => "copy_and_compact",
            Command::ClearTexture(_) => "clear_texture",
            Command::Dispatch(_) => "dispatch",
            Command::Upscale { .. } => "upscale",
            Command::Blit { .. } => "blit",
        }
    }
}

/// Ordered batch of commands.
#[derive(Debug, Default)]
pub struct CommandList {
    label: Option<String>,
    commands: Vec<Command>,
}

impl CommandList {
    pub fn new(label: impl Into<String>) -> Self {
        Self {
            label: Some(label.into()),
            commands: Vec::new(),
        }
    }

    pub fn label(&self) -> Option<&str> {
        self.label.as_deref()
    }

    pub fn commands(&self) -> &[Command] {
        &self.commands
    }

    pub fn len(&self) -> usize {
        self.commands.len()
    }

    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }

    pub fn push(&mut self, command: Command) {
        self.commands.push(command);
    }

    pub fn build_acceleration_structure(
        &mut self,
        descriptor: AccelerationStructureDescriptor,
        scratch: Arc<Buffer>,
        destination: Arc<AccelerationStructure>,
    ) {
        self.push(Command::BuildAccelerationStructure {
            descriptor,
            scratch,
            destination,
        });
    }

    pub fn write_compacted_size(
        &mut self,
        source: Arc<AccelerationStructure>,
        buffer: Arc<Buffer>,
        offset: u64,
    ) {
        self.push(Command::WriteCompactedSize {
            source,
            buffer,
            offset,
        });
    }

    pub fn copy_and_compact(
        &mut self,
        source: Arc<AccelerationStructure>,
        destination: Arc<AccelerationStructure>,
    ) {
        self.push(Command::CopyAndCompact {
            source,
            destination,
        });
    }

    pub fn clear_texture(&mut self, texture: Arc<Texture>) {
        self.push(Command::ClearTexture(texture));
    }

    pub fn dispatch(&mut self, dispatch: DispatchCommand) {
        self.push(Command::Dispatch(dispatch));
    }

    pub fn upscale(&mut self, source: Arc<Texture>, destination: Arc<Texture>) {
        self.push(Command::Upscale {
            source,
            destination,
        });
    }

    pub fn blit(&mut self, source: Arc<Texture>, destination: Arc<Texture>) {
        self.push(Command::Blit {
            source,
            destination,
        });
    }
}

/// What a device reports when a command list retires.
#[derive(Debug, Clone)]
pub struct CompletionInfo {
    pub submission: SubmissionIndex,
    /// Device execution time of the list
    pub gpu_time: Duration,
    pub error: Option<BackendError>,
}

/// Callback run on the device's completion thread.
pub type CompletionHandler = Box<dyn FnOnce(&CompletionInfo) + Send + 'static>;
