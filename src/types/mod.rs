mod market;
mod trading;

pub use market::*;
pub use trading::*;
