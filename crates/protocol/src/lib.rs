pub mod profile;
pub mod shared_str;

pub use profile::{
    AggregatorKind, AggregatorMetadata, NodeExport, SamplerMetadata, SamplerProfile,
    ThreadGroupExport, WindowStatistics,
};
pub use shared_str::SharedStr;
