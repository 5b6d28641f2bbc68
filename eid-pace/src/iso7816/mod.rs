//! Communication with smart cards according to ISO/IEC 7816.


pub mod apdu;
pub mod card;
pub mod commands;
pub mod pcsc_transport;
pub mod status;
pub mod transport;
