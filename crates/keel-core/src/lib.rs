//! Keel Core: shared domain abstractions.
//!
//! This crate defines the traits and types every bounded context depends
//! on, together with the [`unit_of_work::UnitOfWork`] that binds one
//! database transaction to the domain events its aggregates produce. It
//! contains no infrastructure code: storage and broker implementations
//! plug in through the seams in [`session`], [`repository`] and
//! [`publisher`].

pub mod aggregate;
pub mod error;
pub mod event;
pub mod publisher;
pub mod repository;
pub mod session;
pub mod unit_of_work;
