mod run;
mod types;

pub use run::run;
