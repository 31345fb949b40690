//! Error types for the scheduler core
//!
//! Every fallible operation validates its arguments before it touches any
//! scheduler state, so an `Err` always means "nothing changed".

use core::fmt;

use crate::sched::{HelpState, Priority, ResourceId, SchedulerId, ServerId, ThreadId};

/// Main kernel error type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KernelError {
    /// Scheduler-related errors
    SchedulerError(SchedError),

    /// Constant Bandwidth Server errors
    CbsError(CbsError),

    /// Configuration errors (fatal at system start)
    ConfigError(ConfigError),
}

/// Scheduler errors returned by thread, affinity and resource operations
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedError {
    InvalidPriority { priority: Priority },
    InvalidCpuId { cpu: usize },
    /// The processor belongs to another instance or to none
    ProcessorNotOwned { cpu: usize },
    /// The processor is owned already, or still needed by a thread of its
    /// instance
    ProcessorInUse { cpu: usize },
    ThreadNotFound { id: ThreadId },
    SchedulerNotFound { id: SchedulerId },
    ResourceNotFound { id: ResourceId },
    InvalidAffinity,
    InvalidState {
        expected: &'static str,
        actual: &'static str,
    },
    IdleThread { id: ThreadId },
    TooManyThreads { max: usize },
    ResourceInUse,
    NotOwner { resource: ResourceId },
    AlreadyWaiting { thread: ThreadId },
    InvalidHelpTransition { from: HelpState, to: HelpState },
    NotSupported { operation: &'static str },
}

/// Constant Bandwidth Server status codes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CbsError {
    /// Zero budget or period, budget above period, or a thread that cannot
    /// be (de)attached
    InvalidParameter,
    /// Unknown server id
    NoServer { id: ServerId },
    /// Server table exhausted
    Full,
    /// Admitting the request would exceed the processor capacity
    SystemOverload,
}

/// Configuration errors, detected before the system starts
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigError {
    NoProcessors,
    TooManyProcessors { count: usize, max: usize },
    NoThreads,
    NoSchedulers,
    ZeroTickInterval,
    ZeroTimeslice,
    EmptyProcessorSet { scheduler: &'static str },
    ProcessorOutOfRange { scheduler: &'static str, cpu: usize },
    OverlappingProcessors { cpu: usize },
    UniprocessorSpan { scheduler: &'static str, count: usize },
    InvalidPriorityRange { scheduler: &'static str, max: Priority },
    DuplicateName { scheduler: &'static str },
}

/// Result type alias for kernel operations
pub type KernelResult<T> = Result<T, KernelError>;

/// Result type alias for scheduler operations
pub type SchedResult<T> = Result<T, SchedError>;

/// Result type alias for CBS operations
pub type CbsResult<T> = Result<T, CbsError>;

impl fmt::Display for KernelError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::SchedulerError(err) => write!(f, "Scheduler error: {}", err),
            Self::CbsError(err) => write!(f, "CBS error: {}", err),
            Self::ConfigError(err) => write!(f, "Configuration error: {}", err),
        }
    }
}

impl fmt::Display for SchedError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidPriority { priority } => write!(f, "invalid priority {}", priority),
            Self::InvalidCpuId { cpu } => write!(f, "invalid CPU {}", cpu),
            Self::ProcessorNotOwned { cpu } => {
                write!(f, "CPU {} is not owned by this scheduler", cpu)
            }
            Self::ProcessorInUse { cpu } => write!(f, "CPU {} is in use", cpu),
            Self::ThreadNotFound { id } => write!(f, "thread {} not found", id),
            Self::SchedulerNotFound { id } => write!(f, "scheduler {} not found", id),
            Self::ResourceNotFound { id } => write!(f, "resource {} not found", id),
            Self::InvalidAffinity => write!(f, "invalid affinity set"),
            Self::InvalidState { expected, actual } => {
                write!(f, "invalid state: expected {}, found {}", expected, actual)
            }
            Self::IdleThread { id } => write!(f, "thread {} is an idle thread", id),
            Self::TooManyThreads { max } => write!(f, "thread table full ({} threads)", max),
            Self::ResourceInUse => write!(f, "thread owns or waits for a resource"),
            Self::NotOwner { resource } => write!(f, "caller does not own resource {}", resource),
            Self::AlreadyWaiting { thread } => write!(f, "thread {} is already waiting", thread),
            Self::InvalidHelpTransition { from, to } => {
                write!(f, "help state cannot change from {:?} to {:?}", from, to)
            }
            Self::NotSupported { operation } => {
                write!(f, "operation {} not supported by this scheduler", operation)
            }
        }
    }
}

impl fmt::Display for CbsError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidParameter => write!(f, "invalid parameter"),
            Self::NoServer { id } => write!(f, "no server {}", id),
            Self::Full => write!(f, "server table full"),
            Self::SystemOverload => write!(f, "system overload"),
        }
    }
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NoProcessors => write!(f, "no processors configured"),
            Self::TooManyProcessors { count, max } => {
                write!(f, "{} processors configured, at most {} supported", count, max)
            }
            Self::NoThreads => write!(f, "maximum thread count is zero"),
            Self::NoSchedulers => write!(f, "no scheduler instances configured"),
            Self::ZeroTickInterval => write!(f, "microseconds per tick is zero"),
            Self::ZeroTimeslice => write!(f, "ticks per timeslice is zero"),
            Self::EmptyProcessorSet { scheduler } => {
                write!(f, "scheduler {} owns no processor", scheduler)
            }
            Self::ProcessorOutOfRange { scheduler, cpu } => {
                write!(f, "scheduler {} names processor {} which does not exist", scheduler, cpu)
            }
            Self::OverlappingProcessors { cpu } => {
                write!(f, "processor {} is assigned to more than one scheduler", cpu)
            }
            Self::UniprocessorSpan { scheduler, count } => write!(
                f,
                "uniprocessor scheduler {} spans {} processors",
                scheduler, count
            ),
            Self::InvalidPriorityRange { scheduler, max } => {
                write!(f, "scheduler {} has invalid maximum priority {}", scheduler, max)
            }
            Self::DuplicateName { scheduler } => {
                write!(f, "scheduler name {} used twice", scheduler)
            }
        }
    }
}

impl From<SchedError> for KernelError {
    fn from(err: SchedError) -> Self {
        Self::SchedulerError(err)
    }
}

impl From<CbsError> for KernelError {
    fn from(err: CbsError) -> Self {
        Self::CbsError(err)
    }
}

impl From<ConfigError> for KernelError {
    fn from(err: ConfigError) -> Self {
        Self::ConfigError(err)
    }
}
