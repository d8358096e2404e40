mod initialization;
pub use initialization::*;
