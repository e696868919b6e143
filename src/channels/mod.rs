//! Inbound channels. The board is served over HTTP only.

pub mod web;
