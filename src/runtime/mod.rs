//! Execution of ASGs.
//!
//! [`backend`] defines the interface, [`cpu_backend`] implements it with
//! `ndarray`, and [`session`] ties a backend to a set of parameter values.

pub mod backend;
pub mod cpu_backend;
pub mod session;
