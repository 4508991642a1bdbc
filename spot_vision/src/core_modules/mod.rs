pub mod aligner;
pub mod baseline;
pub mod features;
pub mod pixel;
pub mod region;
pub mod spot_state;
