//! WGSL to SPIR-V compilation for the ray-tracing kernel.

use crate::backend::{BackendError, BackendResult, KernelConstants};

/// Kernel constants as WGSL declarations, prepended to the kernel source.
pub fn specialization_prelude(constants: &KernelConstants) -> String {
    format!(
        "const MAX_BOUNCES: u32 = {}u;\n\
         const RESOURCES_STRIDE: u32 = {}u;\n\
         const USE_PRIMITIVE_DATA: bool = {};\n\
         const USE_INTERSECTION_FUNCTIONS: bool = {};\n",
        constants.max_bounces,
        constants.resources_stride,
        constants.use_primitive_data,
        constants.use_intersection_functions,
    )
}

/// Specialize, parse, validate and translate a compute kernel.
pub fn compile_kernel(
    source: &str,
    entry_point: &str,
    constants: &KernelConstants,
) -> BackendResult<Vec<u32>> {
    let source = format!("{}{}", specialization_prelude(constants), source);

    let module = naga::front::wgsl::parse_str(&source).map_err(|e| {
        BackendError::PipelineCreationFailed(format!(
            "WGSL parse error: {}",
            e.emit_to_string(&source)
        ))
    })?;

    let mut validator = naga::valid::Validator::new(
        naga::valid::ValidationFlags::all(),
        naga::valid::Capabilities::RAY_QUERY,
    );
    let info = validator.validate(&module).map_err(|e| {
        BackendError::PipelineCreationFailed(format!(
            "Validation error: {}",
            e.emit_to_string(&source)
        ))
    })?;

    if !module
        .entry_points
        .iter()
        .any(|ep| ep.name == entry_point && ep.stage == naga::ShaderStage::Compute)
    {
        return Err(BackendError::PipelineCreationFailed(format!(
            "Entry point '{entry_point}' not found"
        )));
    }

    // Ray queries need SPIR-V 1.4.
    let options = naga::back::spv::Options {
        lang_version: (1, 4),
        flags: naga::back::spv::WriterFlags::empty(),
        capabilities: None,
        bounds_check_policies: naga::proc::BoundsCheckPolicies::default(),
        binding_map: Default::default(),
        debug_info: None,
        zero_initialize_workgroup_memory: naga::back::spv::ZeroInitializeWorkgroupMemoryMode::None,
    };
    let pipeline_options = naga::back::spv::PipelineOptions {
        shader_stage: naga::ShaderStage::Compute,
        entry_point: entry_point.to_string(),
    };

    naga::back::spv::write_vec(&module, &info, &options, Some(&pipeline_options)).map_err(|e| {
        BackendError::PipelineCreationFailed(format!("SPIR-V generation error: {e}"))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shaders::{RAYTRACING_ENTRY_POINT, RAYTRACING_KERNEL};

    fn constants() -> KernelConstants {
        KernelConstants {
            resources_stride: 24,
            use_intersection_functions: false,
            use_primitive_data: true,
            max_bounces: 3,
        }
    }

    #[test]
    fn prelude_declares_every_constant() {
        let prelude = specialization_prelude(&constants());
        assert!(prelude.contains("const MAX_BOUNCES: u32 = 3u;"));
        assert!(prelude.contains("const RESOURCES_STRIDE: u32 = 24u;"));
        assert!(prelude.contains("const USE_PRIMITIVE_DATA: bool = true;"));
    }

    #[test]
    fn raytracing_kernel_compiles() {
        let spirv = compile_kernel(RAYTRACING_KERNEL, RAYTRACING_ENTRY_POINT, &constants()).unwrap();
        assert_eq!(spirv[0], 0x0723_0203);
    }

    #[test]
    fn unknown_entry_point_fails() {
        assert!(matches!(
            compile_kernel(RAYTRACING_KERNEL, "missing", &constants()),
            Err(BackendError::PipelineCreationFailed(_))
        ));
    }
}
