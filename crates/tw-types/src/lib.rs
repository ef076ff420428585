pub mod params;
pub mod candidate;
pub mod data;
pub mod resample;
pub mod record;
pub mod errors;

pub use params::*;
pub use candidate::*;
pub use data::*;
pub use resample::*;
pub use record::*;
pub use errors::*;
