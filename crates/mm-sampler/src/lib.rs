pub mod error;
pub mod sampler;
pub mod temperature;
pub mod top_k;
pub mod top_p;
pub mod repetition;
pub mod greedy;

pub use error::{Result, SamplerError};
pub use sampler::{TokenLogit, Sampler, SamplerChain};
pub use temperature::TemperatureSampler;
pub use top_k::TopKSampler;
pub use top_p::TopPSampler;
pub use repetition::RepetitionPenaltySampler;
pub use greedy::{GreedySampler, DistSampler};
