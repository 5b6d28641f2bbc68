pub mod crypt;
pub mod der_util;
pub mod iso7816;
pub mod logging;
pub mod pace;
pub mod secure_messaging;
