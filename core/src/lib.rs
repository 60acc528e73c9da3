pub mod block;
pub mod chain;
pub mod constants;
pub mod error;
pub mod track;

pub use block::BlockHeader;
pub use track::TrackKey;
