pub mod constraints;
pub mod contact_constraint;
pub mod integrator;
pub mod island;
pub mod row;
pub mod solver;
