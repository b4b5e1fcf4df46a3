mod check;
mod keygen;

pub use check::run_config_check;
pub use keygen::run_keygen;
