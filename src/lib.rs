//! ## Background
//!
//! A federated query engine answers one query over several heterogeneous data sources. Most of
//! the work should happen inside the sources: every part of the query a source can execute
//! natively is pushed to it as a sub-command, and only what no source can execute is evaluated
//! by the engine itself. Which parts can be pushed depends on what each source declares it
//! supports, and how the rest is joined depends on how many rows each side is expected to
//! produce.
//!
//! This crate is the optimizer of such an engine. It accepts a logical plan, rewrites it with
//! capability-aware rules until a fixed point is reached, and outputs a physical plan whose
//! leaves are pushed commands, ready to be executed.
//!
//! ## Design
//!
//! ### Heuristic Optimizer
//!
//! Planning is rule based. A batch of rules is applied to the plan repeatedly, until a fix
//! point is reached (the plan no longer changes) or the budget of rule applications is
//! exhausted, which always indicates a rule cycle. The plan lives in an arena graph while it
//! is rewritten, so a rewrite replaces a sub-tree by node handle and never aliases a node.
//!
//! ### Capabilities and cost
//!
//! Every rule consults a read-only [`capability::CapabilityRegistry`] snapshot: a pushed command
//! is only ever built if its source declares support for every construct it uses. Cardinality
//! estimates classify regions as strong (cheap) or weak, which decides the driving side of a
//! dependent join.
//!
//! ### Execution
//!
//! The physical plan is executed by a tree of [`exec::ExecNode`]s polled for row batches.
//! Access nodes hand their commands to connectors and never block the driver.
//!
//! ## Reference
//!
//! 1. [Apache Calcite](https://github.com/apache/calcite) HepPlanner, the model of the rule engine.

#[macro_use]
extern crate prettytable;
#[macro_use]
extern crate lazy_static;

pub mod capability;
pub mod command;
pub mod config;
pub mod cost;
pub mod error;
pub mod exec;
pub mod explain;
pub mod expr;
pub mod heuristic;
pub mod operator;
pub mod optimizer;
pub mod plan;
pub mod planner;
pub mod properties;
pub mod rules;
pub mod stat;
