//! Prefetch and progressive loading

mod cancel;
mod preload;
mod window;

pub use cancel::CancellationToken;
pub use preload::{PreloadScheduler, PreloadTicket, ProgressiveOutcome};
pub use window::PreloadWindow;
