//! Photovoltaic water-heating manager.
//!
//! Heats a domestic hot-water boiler from PV surplus during the day and,
//! optionally, pre-heats it overnight so it reaches a target temperature by
//! a configured morning time. The night cycle can be gated on tomorrow's PV
//! forecast. Everything runs inside one manager task fed by host events and
//! timer firings, see [`controller::ManagerController`].

pub mod config;
pub mod controller;
pub mod domain;
pub mod forecast;
pub mod host;
pub mod sensors;
pub mod telemetry;
pub mod timer;
