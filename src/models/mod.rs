pub mod cluster;
pub mod image;
pub mod kubeconfig;
pub mod node;
pub mod registry;

pub use cluster::*;
pub use image::*;
pub use kubeconfig::*;
pub use node::*;
pub use registry::*;
