//! Pipeboard: a sales pipeline board over Teamleader deals and a SharePoint
//! consultant directory.
//!
//! Deals are grouped into opportunities, consultants are dragged onto
//! opportunity phases, and every accepted move is mirrored to the CRM and
//! the document store.

pub mod channels;
pub mod config;
pub mod crm;
pub mod db;
pub mod directory;
pub mod error;
pub mod mail;
pub mod oauth;
pub mod pipeline;
pub mod settings;
