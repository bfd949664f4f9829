//! Contains the events and functionality for monitoring the behavior of a
//! [`Cluster`](crate::Cluster).

pub mod command;
