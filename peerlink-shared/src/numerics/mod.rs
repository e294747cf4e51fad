pub mod exp_filter;
pub mod seq_num;

pub use exp_filter::ExpFilter;
pub use seq_num::SeqNumUnwrapper;
