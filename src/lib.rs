pub use faer;

mod activation;
mod config;
pub mod core;
mod error;
mod init;
mod layer;
mod loss;
mod network;

pub use activation::*;
pub use config::*;
pub use error::*;
pub use init::*;
pub use layer::*;
pub use loss::*;
pub use network::*;

pub(crate) mod utils;
