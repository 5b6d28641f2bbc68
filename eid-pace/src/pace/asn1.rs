//! ASN.1 structures relevant to PACE.


use rasn::{AsnType, Decode, Encode};
use rasn::types::{Integer, ObjectIdentifier};


/// An item of PACE-related security information in the `EF.CardAccess` file.
///
/// The content of `EF.CardAccess` is a SET OF `SecurityInfo` structures; the first item of each is
/// an OID specifying the protocol, but other items need not adhere to this structure. Decode
/// `EF.CardAccess` as a `SetOf<Any>` first, then each entry as a `Vec<Any>` and its first member as
/// an `ObjectIdentifier`, and only decode entries with a PACE protocol OID as `PaceInfo`.
///
/// Specified in ICAO Doc 9303 Part 11 § 9.2.1.
#[derive(AsnType, Clone, Debug, Decode, Encode, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct PaceInfo {
    pub protocol: ObjectIdentifier,
    pub version: Integer,
    pub parameter_id: Option<Integer>,
}
impl PaceInfo {
    pub fn new(
        protocol: ObjectIdentifier,
        version: Integer,
        parameter_id: Option<Integer>,
    ) -> Self {
        Self {
            protocol,
            version,
            parameter_id,
        }
    }
}
