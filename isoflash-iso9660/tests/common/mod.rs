mod builder;

pub use builder::{DirSpec, IsoBuilder};
