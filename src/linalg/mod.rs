pub mod faer_ndarray;
pub mod rootfind;
pub mod utils;
