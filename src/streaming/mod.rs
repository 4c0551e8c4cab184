// Real-time acquisition and block dispatch module
//
// Samples flow from a device source into a fixed-capacity shifting buffer,
// which cuts them into blocks and tells subscribers when each block closes.
//
// Architecture:
// - `source`: Trait for device sessions plus a simulated source for tests and demos
// - `shifting_buffer`: Block-quantized sliding window with quality tracking
// - `subscribers`: Interval subscriptions dispatched on a tokio runtime
// - `acquisition`: Polling loop with open retries and steady-state recovery

pub mod acquisition;
pub mod block;
pub mod shifting_buffer;
pub mod source;
pub mod subscribers;
pub mod types;

pub use acquisition::{
    AcquisitionHandle, AcquisitionLoop, AcquisitionSummary, QualityReport, StepOutcome,
};
pub use block::{Block, BlockCompleted, Sample};
pub use shifting_buffer::{BlockListener, BufferMetrics, ShiftingBuffer, WriteResult};
pub use source::{AcquisitionSource, DeviceSession, OpenParams, SourceState};
pub use subscribers::{SubscriberRegistry, Subscription};
pub use types::{AcquisitionState, QualityCounters, StreamError, StreamResult};
