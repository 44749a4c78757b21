use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum SamplerError {
    #[error("cannot sample from an empty logits vector")]
    EmptyLogits,
    #[error("sampler chain has no stages")]
    EmptyChain,
    #[error("sampler chain ended with {remaining} candidates; the last stage must select exactly one")]
    Unresolved { remaining: usize },
}

pub type Result<T> = std::result::Result<T, SamplerError>;
