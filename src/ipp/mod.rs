//! IPP subsystem
//!
//! Binary wire codec (RFC 8010) and the Get-Printer-Attributes probe that
//! turns a printer's attribute set into its DNS-SD advertisement.

pub mod codec;
pub mod probe;

pub use codec::{IppAttribute, IppGroup, IppMessage, IppValue};
pub use probe::{ipp_service, IppPrinterInfo};
