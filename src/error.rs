use crate::isa::CapabilityLevel;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum AccelError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("shape mismatch: {0}")]
    ShapeMismatch(String),
    #[error("incompatible output buffer: {0}")]
    IncompatibleOutput(String),
    #[error("DispatchStub: missing default kernel for {op}")]
    MissingDefaultKernel { op: &'static str },
    #[error("unknown operation: {0}")]
    UnknownOperation(&'static str),
    #[error("kernel handle type mismatch for {op}: registered as {registered}")]
    HandleTypeMismatch {
        op: &'static str,
        registered: &'static str,
    },
    #[error("cannot register {level} kernel for {op}: dispatch already resolved")]
    RegistrationClosed {
        op: &'static str,
        level: CapabilityLevel,
    },
    #[error("descriptor build failed: {0}")]
    DescriptorBuild(String),
    #[error("unusable descriptor for {op}: {reason}")]
    UnusableDescriptor { op: &'static str, reason: String },
}

pub type AccelResult<T> = Result<T, AccelError>;
