pub mod abi;
pub mod fifo;

pub use fifo::{CommandRing, SoftFifo};
