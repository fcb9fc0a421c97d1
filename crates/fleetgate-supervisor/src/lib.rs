pub mod fleet;
pub mod observer;
pub mod pool;
