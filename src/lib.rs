#![warn(nonstandard_style)]

//! Static cost estimation for dataflow computations: how many floating point operations,
//! transcendental functions, and bytes of memory traffic each instruction needs, and how long it
//! would take at best on hardware with given throughputs.

pub mod analysis;
pub mod error;
pub mod formulas;
pub mod ir;
pub mod options;
pub mod properties;
pub mod shape;

pub use analysis::{CostAnalysis, CostModel, InstructionCost, Subcomputation, Visit, VisitContext};
pub use error::{CostError, Result};
pub use options::Options;
pub use properties::{KeyRule, KeySchema, Properties};
