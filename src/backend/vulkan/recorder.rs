//! Records a [`CommandList`] into a Vulkan command buffer.
//!
//! Every image stays in `GENERAL` layout for its whole life and a global memory
//! barrier separates consecutive commands, so recording is a direct walk over
//! the list. Objects created while recording (query pools, descriptor sets,
//! instance buffers) are returned as [`Transients`] and released once the
//! command buffer's fence signals.

use std::sync::Arc;

use ash::vk;

use super::accel::{
    bottom_level_geometry, build_flags, convert_kind, gather_instances, top_level_geometry,
};
use super::conversion::{color_subresource_layers, color_subresource_range, vk_error};
use super::device::{full_barrier, DeviceContext};
use super::{
    vulkan_acceleration_structure, vulkan_buffer, vulkan_pipeline, vulkan_texture, Payload,
    VulkanBuffer,
};
use crate::backend::{
    AccelerationStructureDescriptor, BackendError, BackendResult, Binding, Command, CommandList,
    DispatchCommand,
};
use crate::resources::{AccelerationStructure, Buffer, Texture};
use crate::shaders::slot;

/// Objects that must outlive the command buffer that references them.
#[derive(Default)]
pub struct Transients {
    buffers: Vec<Arc<VulkanBuffer>>,
    query_pools: Vec<vk::QueryPool>,
    descriptor_sets: Vec<vk::DescriptorSet>,
}

impl Transients {
    pub fn release(self, context: &DeviceContext) {
        context.free_descriptor_sets(&self.descriptor_sets);
        for pool in self.query_pools {
            unsafe { context.device.destroy_query_pool(pool, None) };
        }
        drop(self.buffers);
    }
}

/// A fully recorded, not yet submitted, command buffer.
pub struct Recorded {
    pub command_buffer: vk::CommandBuffer,
    /// Two timestamps bracketing the whole list
    pub timestamps: Option<vk::QueryPool>,
    pub transients: Transients,
}

impl Recorded {
    pub fn release(self, context: &DeviceContext) {
        context.free_command_buffer(self.command_buffer);
        self.transients.release(context);
    }
}

pub fn record(context: &Arc<DeviceContext>, list: &CommandList) -> BackendResult<Recorded> {
    let command_buffer = context.allocate_command_buffer()?;
    let mut recorder = Recorder {
        context,
        command_buffer,
        transients: Transients::default(),
    };
    match recorder.record_list(list) {
        Ok(timestamps) => Ok(Recorded {
            command_buffer,
            timestamps,
            transients: recorder.transients,
        }),
        Err(error) => {
            Recorded {
                command_buffer,
                timestamps: None,
                transients: recorder.transients,
            }
            .release(context);
            Err(error)
        }
    }
}

struct Recorder<'a> {
    context: &'a Arc<DeviceContext>,
    command_buffer: vk::CommandBuffer,
    transients: Transients,
}

impl Recorder<'_> {
    fn device(&self) -> &ash::Device {
        &self.context.device
    }

    fn record_list(&mut self, list: &CommandList) -> BackendResult<Option<vk::QueryPool>> {
        let begin =
            vk::CommandBufferBeginInfo::default().flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);
        unsafe { self.device().begin_command_buffer(self.command_buffer, &begin) }
            .map_err(|e| vk_error("begin command buffer", e))?;

        let timestamps = match self.context.properties.timestamp_period {
            Some(_) => {
                let pool = self.query_pool(vk::QueryType::TIMESTAMP, 2)?;
                unsafe {
                    self.device().cmd_write_timestamp(
                        self.command_buffer,
                        vk::PipelineStageFlags::TOP_OF_PIPE,
                        pool,
                        0,
                    );
                }
                Some(pool)
            }
            None => None,
        };

        for command in list.commands() {
            log::trace!("VulkanBackend: {} ({:?})", command.name(), list.label());
            full_barrier(self.device(), self.command_buffer);
            self.command(command)?;
        }

        unsafe {
            if let Some(pool) = timestamps {
                self.device().cmd_write_timestamp(
                    self.command_buffer,
                    vk::PipelineStageFlags::BOTTOM_OF_PIPE,
                    pool,
                    1,
                );
            }
            self.device()
                .end_command_buffer(self.command_buffer)
                .map_err(|e| vk_error("end command buffer", e))?;
        }
        Ok(timestamps)
    }

    fn query_pool(&mut self, ty: vk::QueryType, count: u32) -> BackendResult<vk::QueryPool> {
        let info = vk::QueryPoolCreateInfo::default()
            .query_type(ty)
            .query_count(count);
        let pool = unsafe { self.device().create_query_pool(&info, None) }
            .map_err(|e| vk_error("create query pool", e))?;
        self.transients.query_pools.push(pool);
        unsafe {
            self.device()
                .cmd_reset_query_pool(self.command_buffer, pool, 0, count)
        };
        Ok(pool)
    }

    fn command(&mut self, command: &Command) -> BackendResult<()> {
        match command {
            Command::BuildAccelerationStructure {
                descriptor,
                scratch,
                destination,
            } => self.build(descriptor, scratch, destination),
            Command::WriteCompactedSize {
                source,
                buffer,
                offset,
            } => self.write_compacted_size(source, buffer, *offset),
            Command::CopyAndCompact {
                source,
                destination,
            } => self.copy_and_compact(source, destination),
            Command::ClearTexture(texture) => self.clear(texture),
            Command::Dispatch(dispatch) => self.dispatch(dispatch),
            Command::Upscale {
                source,
                destination,
            } => {
                let filter = if self.context.properties.linear_float_blit {
                    vk::Filter::LINEAR
                } else {
                    vk::Filter::NEAREST
                };
                self.blit(source, destination, filter)
            }
            Command::Blit {
                source,
                destination,
            } => self.blit(source, destination, vk::Filter::NEAREST),
        }
    }

    fn build(
        &mut self,
        descriptor: &AccelerationStructureDescriptor,
        scratch: &Buffer,
        destination: &AccelerationStructure,
    ) -> BackendResult<()> {
        if destination.kind() != descriptor.kind() {
            return Err(BackendError::ExecutionFailed(format!(
                "building a {:?} structure into {:?} storage",
                descriptor.kind(),
                destination.kind()
            )));
        }
        let target = vulkan_acceleration_structure(destination)?;

        let (geometry, primitive_count) = match descriptor {
            AccelerationStructureDescriptor::BottomLevel(geometry) => {
                let described = bottom_level_geometry(geometry)?;
                target.set_payload(geometry.primitive_data().map(|data| Payload::Primitives {
                    buffer: Arc::clone(&data.buffer),
                    stride: data.stride,
                    count: geometry.primitive_count(),
                }));
                described
            }
            AccelerationStructureDescriptor::TopLevel(top) => {
                let gathered = gather_instances(self.context, top)?;
                for &(source, offset, size) in &gathered.copies {
                    let region = vk::BufferCopy::default()
                        .src_offset(0)
                        .dst_offset(offset)
                        .size(size);
                    unsafe {
                        self.device().cmd_copy_buffer(
                            self.command_buffer,
                            source,
                            gathered.payload.raw(),
                            &[region],
                        );
                    }
                }
                let geometry = top_level_geometry(gathered.instances.address());
                target.set_payload(Some(Payload::Gathered(gathered.payload)));
                self.transients.buffers.push(gathered.instances);
                (geometry, top.instance_count)
            }
        };

        let alignment = self.context.properties.scratch_offset_alignment.max(1);
        let scratch_address = vulkan_buffer(scratch)?.address().next_multiple_of(alignment);

        let geometries = [geometry];
        let build_info = vk::AccelerationStructureBuildGeometryInfoKHR::default()
            .ty(convert_kind(descriptor.kind()))
            .flags(build_flags())
            .mode(vk::BuildAccelerationStructureModeKHR::BUILD)
            .dst_acceleration_structure(target.raw())
            .geometries(&geometries)
            .scratch_data(vk::DeviceOrHostAddressKHR {
                device_address: scratch_address,
            });
        let ranges =
            [vk::AccelerationStructureBuildRangeInfoKHR::default().primitive_count(primitive_count)];
        unsafe {
            self.context
                .acceleration_structure
                .cmd_build_acceleration_structures(self.command_buffer, &[build_info], &[&ranges]);
        }
        log::trace!(
            "VulkanBackend: recorded {:?} build of {:?} ({} primitives)",
            descriptor.kind(),
            destination.label(),
            primitive_count
        );
        Ok(())
    }

    fn write_compacted_size(
        &mut self,
        source: &AccelerationStructure,
        buffer: &Buffer,
        offset: u64,
    ) -> BackendResult<()> {
        let structure = vulkan_acceleration_structure(source)?.raw();
        let destination = vulkan_buffer(buffer)?.raw();
        let pool = self.query_pool(vk::QueryType::ACCELERATION_STRUCTURE_COMPACTED_SIZE_KHR, 1)?;
        unsafe {
            self.context
                .acceleration_structure
                .cmd_write_acceleration_structures_properties(
                    self.command_buffer,
                    &[structure],
                    vk::QueryType::ACCELERATION_STRUCTURE_COMPACTED_SIZE_KHR,
                    pool,
                    0,
                );
            full_barrier(self.device(), self.command_buffer);
            self.device().cmd_copy_query_pool_results(
                self.command_buffer,
                pool,
                0,
                1,
                destination,
                offset,
                8,
                vk::QueryResultFlags::TYPE_64 | vk::QueryResultFlags::WAIT,
            );
        }
        Ok(())
    }

    fn copy_and_compact(
        &mut self,
        source: &AccelerationStructure,
        destination: &AccelerationStructure,
    ) -> BackendResult<()> {
        if source.kind() != destination.kind() {
            return Err(BackendError::ExecutionFailed(
                "copy_and_compact between different structure kinds".into(),
            ));
        }
        let source = vulkan_acceleration_structure(source)?;
        let destination = vulkan_acceleration_structure(destination)?;
        let info = vk::CopyAccelerationStructureInfoKHR::default()
            .src(source.raw())
            .dst(destination.raw())
            .mode(vk::CopyAccelerationStructureModeKHR::COMPACT);
        unsafe {
            self.context
                .acceleration_structure
                .cmd_copy_acceleration_structure(self.command_buffer, &info);
        }
        destination.set_payload(source.payload());
        Ok(())
    }

    fn clear(&mut self, texture: &Texture) -> BackendResult<()> {
        let image = vulkan_texture(texture)?.raw();
        let zero = vk::ClearColorValue {
            float32: [0.0; 4],
        };
        unsafe {
            self.device().cmd_clear_color_image(
                self.command_buffer,
                image,
                vk::ImageLayout::GENERAL,
                &zero,
                &[color_subresource_range()],
            );
        }
        Ok(())
    }

    fn dispatch(&mut self, dispatch: &DispatchCommand) -> BackendResult<()> {
        let pipeline = vulkan_pipeline(&dispatch.pipeline)?;
        let set = self.context.allocate_descriptor_set(pipeline.set_layout())?;
        self.transients.descriptor_sets.push(set);

        for (index, binding) in &dispatch.bindings {
            match (*index, binding) {
                // Primitive payloads come from the gathered buffer of the scene structure.
                (slot::RESOURCES, _) | (slot::INTERSECTION_FUNCTION_TABLE, _) => {}
                (slot::ACCELERATION_STRUCTURE, Binding::AccelerationStructure(structure)) => {
                    let structure = vulkan_acceleration_structure(structure)?;
                    let payload = match structure.payload() {
                        Some(Payload::Gathered(payload)) => payload,
                        _ => {
                            return Err(BackendError::ExecutionFailed(
                                "dispatch bound a top-level structure that was never built".into(),
                            ))
                        }
                    };
                    self.write_acceleration_structure(set, *index, structure.raw());
                    self.write_buffer(
                        set,
                        slot::RESOURCES,
                        vk::DescriptorType::STORAGE_BUFFER,
                        payload.raw(),
                        0,
                        vk::WHOLE_SIZE,
                    );
                }
                (_, Binding::UniformBuffer {
                    buffer,
                    offset,
                    size,
                }) => {
                    let raw = vulkan_buffer(buffer)?.raw();
                    self.write_buffer(set, *index, vk::DescriptorType::UNIFORM_BUFFER, raw, *offset, *size);
                }
                (_, Binding::StorageBuffer(buffer)) => {
                    let raw = vulkan_buffer(buffer)?.raw();
                    self.write_buffer(
                        set,
                        *index,
                        vk::DescriptorType::STORAGE_BUFFER,
                        raw,
                        0,
                        vk::WHOLE_SIZE,
                    );
                }
                (_, Binding::Texture(texture)) => {
                    let view = vulkan_texture(texture)?.view();
                    self.write_image(set, *index, vk::DescriptorType::SAMPLED_IMAGE, view);
                }
                (_, Binding::StorageTexture(texture)) => {
                    let view = vulkan_texture(texture)?.view();
                    self.write_image(set, *index, vk::DescriptorType::STORAGE_IMAGE, view);
                }
                (_, other) => {
                    return Err(BackendError::ExecutionFailed(format!(
                        "slot {index} cannot take {other:?}"
                    )))
                }
            }
        }

        let [x, y] = dispatch.workgroups();
        unsafe {
            let device = self.device();
            device.cmd_bind_pipeline(self.command_buffer, vk::PipelineBindPoint::COMPUTE, pipeline.raw());
            device.cmd_bind_descriptor_sets(
                self.command_buffer,
                vk::PipelineBindPoint::COMPUTE,
                pipeline.layout(),
                0,
                &[set],
                &[],
            );
            device.cmd_dispatch(self.command_buffer, x, y, 1);
        }
        Ok(())
    }

    fn write_buffer(
        &self,
        set: vk::DescriptorSet,
        binding: u32,
        ty: vk::DescriptorType,
        buffer: vk::Buffer,
        offset: u64,
        range: u64,
    ) {
        let infos = [vk::DescriptorBufferInfo::default()
            .buffer(buffer)
            .offset(offset)
            .range(range)];
        let write = vk::WriteDescriptorSet::default()
            .dst_set(set)
            .dst_binding(binding)
            .descriptor_type(ty)
            .buffer_info(&infos);
        unsafe { self.device().update_descriptor_sets(&[write], &[]) };
    }

    fn write_image(
        &self,
        set: vk::DescriptorSet,
        binding: u32,
        ty: vk::DescriptorType,
        view: vk::ImageView,
    ) {
        let infos = [vk::DescriptorImageInfo::default()
            .image_view(view)
            .image_layout(vk::ImageLayout::GENERAL)];
        let write = vk::WriteDescriptorSet::default()
            .dst_set(set)
            .dst_binding(binding)
            .descriptor_type(ty)
            .image_info(&infos);
        unsafe { self.device().update_descriptor_sets(&[write], &[]) };
    }

    fn write_acceleration_structure(
        &self,
        set: vk::DescriptorSet,
        binding: u32,
        structure: vk::AccelerationStructureKHR,
    ) {
        let structures = [structure];
        let mut info = vk::WriteDescriptorSetAccelerationStructureKHR::default()
            .acceleration_structures(&structures);
        let write = vk::WriteDescriptorSet::default()
            .dst_set(set)
            .dst_binding(binding)
            .descriptor_type(vk::DescriptorType::ACCELERATION_STRUCTURE_KHR)
            .descriptor_count(1)
            .push_next(&mut info);
        unsafe { self.device().update_descriptor_sets(&[write], &[]) };
    }

    fn blit(&mut self, source: &Texture, destination: &Texture, filter: vk::Filter) -> BackendResult<()> {
        let src = vulkan_texture(source)?.raw();
        let dst = vulkan_texture(destination)?.raw();
        let corner = |(width, height): (u32, u32)| vk::Offset3D {
            x: width as i32,
            y: height as i32,
            z: 1,
        };
        let region = vk::ImageBlit::default()
            .src_subresource(color_subresource_layers())
            .src_offsets([vk::Offset3D::default(), corner(source.size())])
            .dst_subresource(color_subresource_layers())
            .dst_offsets([vk::Offset3D::default(), corner(destination.size())]);
        unsafe {
            self.device().cmd_blit_image(
                self.command_buffer,
                src,
                vk::ImageLayout::GENERAL,
                dst,
                vk::ImageLayout::GENERAL,
                &[region],
                filter,
            );
        }
        Ok(())
    }
}
