/// Periodic tracking loop driving a coordinator.
pub mod driver;
/// Cooperative shutdown signal shared by background tasks.
pub mod shutdown;

pub use driver::TrackingDriver;
pub use shutdown::ShutdownToken;
