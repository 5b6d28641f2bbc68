//! Classification of status words (SW1-SW2) according to ISO/IEC 7816-4.


use std::fmt;


/// A status word returned by the card, classified.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub enum StatusWord {
    /// 0x9000
    Success,

    /// 0x61xx; xx bytes are still available.
    MoreData { available: u8 },

    /// 0x6281
    Corrupted,

    /// 0x6282
    EndOfFile,

    /// Other 0x62xx.
    Warning { sw2: u8 },

    /// 0x63Cx; x tries remain.
    RetriesRemaining { remaining: u8 },

    /// 0x64xx
    ExecutionError { sw2: u8 },

    /// 0x65xx
    PersistentError { sw2: u8 },

    /// 0x66xx
    SecurityError { sw2: u8 },

    /// 0x6700
    WrongLength,

    /// 0x6881
    LogicalChannelNotSupported,

    /// 0x6882
    SecureMessagingNotSupported,

    /// 0x6982
    SecurityStatusNotSatisfied,

    /// 0x6983
    AuthenticationBlocked,

    /// 0x6984
    ReferenceDataNotUsable,

    /// 0x6987
    SecureMessagingObjectsMissing,

    /// 0x6988
    SecureMessagingObjectsIncorrect,

    /// 0x6A82
    FileNotFound,

    /// 0x6A86
    IncorrectParameters,

    /// 0x6D00
    InstructionNotSupported,

    /// 0x6E00
    ClassNotSupported,

    /// Anything else.
    Other { word: u16 },
}
impl StatusWord {
    pub const fn from_word(word: u16) -> Self {
        let [sw1, sw2] = word.to_be_bytes();
        match (sw1, sw2) {
            (0x90, 0x00) => Self::Success,
            (0x61, available) => Self::MoreData { available },
            (0x62, 0x81) => Self::Corrupted,
            (0x62, 0x82) => Self::EndOfFile,
            (0x62, sw2) => Self::Warning { sw2 },
            (0x63, sw2) if sw2 & 0xF0 == 0xC0 => Self::RetriesRemaining { remaining: sw2 & 0x0F },
            (0x64, sw2) => Self::ExecutionError { sw2 },
            (0x65, sw2) => Self::PersistentError { sw2 },
            (0x66, sw2) => Self::SecurityError { sw2 },
            (0x67, 0x00) => Self::WrongLength,
            (0x68, 0x81) => Self::LogicalChannelNotSupported,
            (0x68, 0x82) => Self::SecureMessagingNotSupported,
            (0x69, 0x82) => Self::SecurityStatusNotSatisfied,
            (0x69, 0x83) => Self::AuthenticationBlocked,
            (0x69, 0x84) => Self::ReferenceDataNotUsable,
            (0x69, 0x87) => Self::SecureMessagingObjectsMissing,
            (0x69, 0x88) => Self::SecureMessagingObjectsIncorrect,
            (0x6A, 0x82) => Self::FileNotFound,
            (0x6A, 0x86) => Self::IncorrectParameters,
            (0x6D, 0x00) => Self::InstructionNotSupported,
            (0x6E, 0x00) => Self::ClassNotSupported,
            _ => Self::Other { word },
        }
    }

    pub const fn to_word(&self) -> u16 {
        match self {
            Self::Success => 0x9000,
            Self::MoreData { available } => 0x6100 | (*available as u16),
            Self::Corrupted => 0x6281,
            Self::EndOfFile => 0x6282,
            Self::Warning { sw2 } => 0x6200 | (*sw2 as u16),
            Self::RetriesRemaining { remaining } => 0x63C0 | ((*remaining & 0x0F) as u16),
            Self::ExecutionError { sw2 } => 0x6400 | (*sw2 as u16),
            Self::PersistentError { sw2 } => 0x6500 | (*sw2 as u16),
            Self::SecurityError { sw2 } => 0x6600 | (*sw2 as u16),
            Self::WrongLength => 0x6700,
            Self::LogicalChannelNotSupported => 0x6881,
            Self::SecureMessagingNotSupported => 0x6882,
            Self::SecurityStatusNotSatisfied => 0x6982,
            Self::AuthenticationBlocked => 0x6983,
            Self::ReferenceDataNotUsable => 0x6984,
            Self::SecureMessagingObjectsMissing => 0x6987,
            Self::SecureMessagingObjectsIncorrect => 0x6988,
            Self::FileNotFound => 0x6A82,
            Self::IncorrectParameters => 0x6A86,
            Self::InstructionNotSupported => 0x6D00,
            Self::ClassNotSupported => 0x6E00,
            Self::Other { word } => *word,
        }
    }

    pub const fn is_success(&self) -> bool {
        matches!(self, Self::Success)
    }

    /// Whether the status signals a failed authentication or an unsatisfied security condition.
    pub const fn is_security_failure(&self) -> bool {
        matches!(
            self,
            Self::SecurityError { .. } | Self::SecurityStatusNotSatisfied
            | Self::AuthenticationBlocked | Self::ReferenceDataNotUsable
            | Self::SecureMessagingObjectsMissing | Self::SecureMessagingObjectsIncorrect
        )
    }

    /// Whether retrying the same command cannot succeed.
    pub const fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::SecurityStatusNotSatisfied | Self::AuthenticationBlocked
            | Self::WrongLength | Self::LogicalChannelNotSupported
            | Self::SecureMessagingNotSupported | Self::IncorrectParameters
            | Self::InstructionNotSupported | Self::ClassNotSupported
        )
    }

    /// The number of remaining password tries, if the status carries it.
    pub const fn remaining_tries(&self) -> Option<u8> {
        match self {
            Self::RetriesRemaining { remaining } => Some(*remaining),
            Self::AuthenticationBlocked => Some(0),
            _ => None,
        }
    }

    pub const fn description(&self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::MoreData { .. } => "more data available",
            Self::Corrupted => "returned data may be corrupted",
            Self::EndOfFile => "end of file reached",
            Self::Warning { .. } => "warning",
            Self::RetriesRemaining { .. } => "verification failed",
            Self::ExecutionError { .. } => "execution error",
            Self::PersistentError { .. } => "persistent memory error",
            Self::SecurityError { .. } => "security error",
            Self::WrongLength => "wrong length",
            Self::LogicalChannelNotSupported => "logical channel not supported",
            Self::SecureMessagingNotSupported => "secure messaging not supported",
            Self::SecurityStatusNotSatisfied => "security status not satisfied",
            Self::AuthenticationBlocked => "authentication method blocked",
            Self::ReferenceDataNotUsable => "reference data not usable",
            Self::SecureMessagingObjectsMissing => "expected secure messaging data objects missing",
            Self::SecureMessagingObjectsIncorrect => "incorrect secure messaging data objects",
            Self::FileNotFound => "file or application not found",
            Self::IncorrectParameters => "incorrect parameters P1-P2",
            Self::InstructionNotSupported => "instruction not supported",
            Self::ClassNotSupported => "class not supported",
            Self::Other { .. } => "unknown status",
        }
    }
}
impl From<u16> for StatusWord {
    fn from(value: u16) -> Self { Self::from_word(value) }
}
impl fmt::Display for StatusWord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:04X} ({}", self.to_word(), self.description())?;
        if let Some(remaining) = self.remaining_tries() {
            write!(f, ", {} tries remaining", remaining)?;
        }
        write!(f, ")")
    }
}


#[cfg(test)]
mod tests {
    use super::StatusWord;

    #[test]
    fn test_classification() {
        assert_eq!(StatusWord::from_word(0x9000), StatusWord::Success);
        assert!(StatusWord::from_word(0x9000).is_success());

        let retries = StatusWord::from_word(0x63C3);
        assert_eq!(retries, StatusWord::RetriesRemaining { remaining: 3 });
        assert_eq!(retries.remaining_tries(), Some(3));
        assert!(!retries.is_fatal());

        let denied = StatusWord::from_word(0x6982);
        assert!(denied.is_security_failure());
        assert!(denied.is_fatal());

        assert_eq!(StatusWord::from_word(0x6983).remaining_tries(), Some(0));
        assert!(StatusWord::from_word(0x6E00).is_fatal());
        assert_eq!(StatusWord::from_word(0x6110), StatusWord::MoreData { available: 0x10 });

        // 0x63 without the C nibble is just unknown
        assert_eq!(StatusWord::from_word(0x6300), StatusWord::Other { word: 0x6300 });
    }

    #[test]
    fn test_word_survives_classification() {
        for word in [0x9000, 0x6110, 0x6281, 0x6282, 0x6283, 0x63C0, 0x63CF, 0x6400, 0x6581, 0x6600,
                0x6700, 0x6881, 0x6882, 0x6982, 0x6983, 0x6984, 0x6987, 0x6988, 0x6A82, 0x6A86,
                0x6D00, 0x6E00, 0x6F00, 0x6300] {
            assert_eq!(StatusWord::from_word(word).to_word(), word);
        }
    }

    #[test]
    fn test_display() {
        assert_eq!(StatusWord::from_word(0x63C2).to_string(), "0x63C2 (verification failed, 2 tries remaining)");
        assert_eq!(StatusWord::from_word(0x6A82).to_string(), "0x6A82 (file or application not found)");
    }
}
