pub mod playthrough;
pub mod policy;
pub mod reports;
pub mod seeds;
pub mod tester;
pub mod validation;

pub use policy::Strategy;
pub use seeds::resolve_seed_inputs;
pub use tester::*;
pub use validation::validate_catalog;
