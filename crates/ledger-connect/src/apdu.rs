use crate::backend::{BackendError, BackendResult};

const HEADER_LEN: usize = 5; // cla + ins + p1 + p2 + lc
const STATUS_LEN: usize = 2;
const MAX_SHORT_DATA_LEN: usize = u8::MAX as usize;

pub const CLA_DASHBOARD: u8 = 0xB0;
pub const CLA_APP: u8 = 0xE0;
pub const INS_GET_APP_AND_VERSION: u8 = 0x01;
pub const INS_QUIT_APP: u8 = 0xA7;
pub const INS_OPEN_APP: u8 = 0xD8;

/// Two-byte status word trailing every device response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StatusWord(pub u16);

impl StatusWord {
    pub const OK: Self = Self(0x9000);
    pub const APP_NOT_FOUND: Self = Self(0x6807);
    pub const APP_NOT_FOUND_LEGACY: Self = Self(0x6984);
    /// Returned when the user rejects an on-device prompt.
    pub const CONDITIONS_NOT_SATISFIED: Self = Self(0x6985);
    pub const USER_REFUSED: Self = Self(0x5501);
    pub const DEVICE_LOCKED: Self = Self(0x6b0c);
    pub const LOCKED_DEVICE: Self = Self(0x5515);
    pub const CLA_NOT_SUPPORTED: Self = Self(0x6e00);
    pub const UNKNOWN: Self = Self(0x6f00);

    pub fn is_ok(self) -> bool {
        self == Self::OK
    }

    pub fn is_app_not_found(self) -> bool {
        matches!(self, Self::APP_NOT_FOUND | Self::APP_NOT_FOUND_LEGACY)
    }

    pub fn is_user_refusal(self) -> bool {
        matches!(self, Self::CONDITIONS_NOT_SATISFIED | Self::USER_REFUSED)
    }

    pub fn is_locked(self) -> bool {
        matches!(self, Self::DEVICE_LOCKED | Self::LOCKED_DEVICE)
    }
}

impl std::fmt::Display for StatusWord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "0x{:04x}", self.0)
    }
}

/// Short-form APDU command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApduCommand {
    pub cla: u8,
    pub ins: u8,
    pub p1: u8,
    pub p2: u8,
    pub data: Vec<u8>,
}

impl ApduCommand {
    pub fn new(cla: u8, ins: u8) -> Self {
        Self {
            cla,
            ins,
            p1: 0,
            p2: 0,
            data: Vec::new(),
        }
    }

    pub fn with_data(mut self, data: impl Into<Vec<u8>>) -> Self {
        self.data = data.into();
        self
    }

    pub fn get_app_and_version() -> Self {
        Self::new(CLA_DASHBOARD, INS_GET_APP_AND_VERSION)
    }

    pub fn open_app(name: &str) -> Self {
        Self::new(CLA_APP, INS_OPEN_APP).with_data(name.as_bytes())
    }

    pub fn quit_app() -> Self {
        Self::new(CLA_DASHBOARD, INS_QUIT_APP)
    }

    pub fn encode(&self) -> BackendResult<Vec<u8>> {
        if self.data.len() > MAX_SHORT_DATA_LEN {
            return Err(BackendError::Malformed(format!(
                "apdu data too long: {} bytes",
                self.data.len()
            )));
        }
        let mut bytes = Vec::with_capacity(HEADER_LEN + self.data.len());
        bytes.extend_from_slice(&[self.cla, self.ins, self.p1, self.p2]);
        bytes.push(self.data.len() as u8);
        bytes.extend_from_slice(&self.data);
        Ok(bytes)
    }

    pub fn decode(bytes: &[u8]) -> BackendResult<Self> {
        if bytes.len() < HEADER_LEN {
            return Err(BackendError::Malformed("apdu shorter than header".into()));
        }
        let lc = bytes[4] as usize;
        let data = &bytes[HEADER_LEN..];
        if data.len() != lc {
            return Err(BackendError::Malformed(format!(
                "apdu lc={lc} but carries {} bytes",
                data.len()
            )));
        }
        Ok(Self {
            cla: bytes[0],
            ins: bytes[1],
            p1: bytes[2],
            p2: bytes[3],
            data: data.to_vec(),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApduAnswer {
    pub data: Vec<u8>,
    pub status: StatusWord,
}

impl ApduAnswer {
    pub fn ok(data: impl Into<Vec<u8>>) -> Self {
        Self {
            data: data.into(),
            status: StatusWord::OK,
        }
    }

    pub fn status(status: StatusWord) -> Self {
        Self {
            data: Vec::new(),
            status,
        }
    }

    pub fn decode(bytes: &[u8]) -> BackendResult<Self> {
        if bytes.len() < STATUS_LEN {
            return Err(BackendError::Malformed(format!(
                "response too short: {} bytes",
                bytes.len()
            )));
        }
        let split = bytes.len() - STATUS_LEN;
        let status = u16::from_be_bytes([bytes[split], bytes[split + 1]]);
        Ok(Self {
            data: bytes[..split].to_vec(),
            status: StatusWord(status),
        })
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(self.data.len() + STATUS_LEN);
        bytes.extend_from_slice(&self.data);
        bytes.extend_from_slice(&self.status.0.to_be_bytes());
        bytes
    }

    /// Turns a non-success status word into [`BackendError::Status`].
    pub fn into_result(self) -> BackendResult<Vec<u8>> {
        if self.status.is_ok() {
            Ok(self.data)
        } else {
            Err(BackendError::Status(self.status.0))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn open_app_carries_name_with_length_prefix() {
        let bytes = ApduCommand::open_app("Ethereum").encode().unwrap();
        assert_eq!(&bytes[..5], &[0xE0, 0xD8, 0x00, 0x00, 0x08]);
        assert_eq!(&bytes[5..], b"Ethereum");
    }

    #[test]
    fn decode_rejects_lc_mismatch() {
        let err = ApduCommand::decode(&[0xB0, 0x01, 0, 0, 3, 1]).unwrap_err();
        assert!(matches!(err, BackendError::Malformed(_)));
    }

    #[test]
    fn encode_rejects_oversized_data() {
        let cmd = ApduCommand::new(CLA_APP, 0x08).with_data(vec![0u8; 256]);
        assert!(matches!(cmd.encode(), Err(BackendError::Malformed(_))));
    }

    #[test]
    fn answer_splits_trailing_status_word() {
        let answer = ApduAnswer::decode(&[0xAA, 0xBB, 0x69, 0x85]).unwrap();
        assert_eq!(answer.data, vec![0xAA, 0xBB]);
        assert_eq!(answer.status, StatusWord::CONDITIONS_NOT_SATISFIED);
        assert!(answer.status.is_user_refusal());
        assert!(matches!(
            answer.into_result(),
            Err(BackendError::Status(0x6985))
        ));
    }

    #[test]
    fn answer_shorter_than_status_is_malformed() {
        assert!(matches!(
            ApduAnswer::decode(&[0x90]),
            Err(BackendError::Malformed(_))
        ));
    }

    #[test]
    fn status_word_groups() {
        assert!(StatusWord(0x6984).is_app_not_found());
        assert!(StatusWord(0x5515).is_locked());
        assert!(!StatusWord::OK.is_locked());
        assert_eq!(StatusWord(0x6b0c).to_string(), "0x6b0c");
    }
}
