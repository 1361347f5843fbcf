//! Ray tracing support via Vulkan KHR extensions.

pub mod acceleration;
pub mod pipeline;

pub use acceleration::AccelerationStructure;
pub use pipeline::RaytracingPipelineObject;
