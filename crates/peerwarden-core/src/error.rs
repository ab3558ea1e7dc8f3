use peerwarden_types::ReasonCode;

use crate::address::AddressError;
use crate::allocator::AllocError;
use crate::db::StoreError;
use crate::files::FileError;
use crate::keys::CipherError;
use crate::schedule::ScheduleError;

#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    #[error("invalid peer name {0:?}: use 1-64 letters, digits, '_' or '-'")]
    InvalidName(String),

    #[error("invalid subnet: {0}")]
    InvalidCidr(AddressError),

    #[error("invalid address: {0}")]
    InvalidAddress(AddressError),

    #[error("unknown subnet preset: {0}")]
    UnknownPreset(String),

    #[error("{0}")]
    Allocation(AllocError),

    #[error("name already taken")]
    DuplicateName,

    #[error("public key already registered")]
    DuplicateKey,

    #[error("subnet change rejected: {0}")]
    SubnetConflict(String),

    #[error("invalid schedule: {0}")]
    Schedule(#[from] ScheduleError),

    #[error("{0}")]
    InvalidState(String),

    #[error("peer not found: {0}")]
    NotFound(String),

    #[error("file side effect failed: {0}")]
    SideEffect(#[from] FileError),

    #[error("key handling failed: {0}")]
    Cipher(#[from] CipherError),

    #[error("store error: {0}")]
    Store(StoreError),
}

impl GatewayError {
    pub fn reason(&self) -> ReasonCode {
        match self {
            Self::InvalidName(_) => ReasonCode::InvalidName,
            Self::InvalidCidr(_) => ReasonCode::InvalidCidr,
            Self::InvalidAddress(_) => ReasonCode::InvalidAddress,
            Self::UnknownPreset(_) => ReasonCode::UnknownPreset,
            Self::Allocation(e) => match e {
                AllocError::SubnetFull { .. } => ReasonCode::SubnetExhausted,
                AllocError::CapacityExceeded { .. } => ReasonCode::CapacityExceeded,
                AllocError::OutsideSubnet { .. }
                | AllocError::Reserved(_)
                | AllocError::InUse(_) => ReasonCode::AddressUnavailable,
                AllocError::Address(_) => ReasonCode::InvalidAddress,
                AllocError::Store(_) => ReasonCode::Internal,
                AllocError::File(_) => ReasonCode::SideEffect,
            },
            Self::DuplicateName => ReasonCode::DuplicateName,
            Self::DuplicateKey => ReasonCode::DuplicateKey,
            Self::SubnetConflict(_) => ReasonCode::SubnetConflict,
            Self::Schedule(_) => ReasonCode::InvalidSchedule,
            Self::InvalidState(_) => ReasonCode::InvalidState,
            Self::NotFound(_) => ReasonCode::NotFound,
            Self::SideEffect(_) => ReasonCode::SideEffect,
            Self::Cipher(_) | Self::Store(_) => ReasonCode::Internal,
        }
    }
}

impl From<StoreError> for GatewayError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::DuplicateName => Self::DuplicateName,
            StoreError::DuplicateKey => Self::DuplicateKey,
            StoreError::Database(_) | StoreError::Corrupt(_) => {
                tracing::error!(error = %err, "store error");
                Self::Store(err)
            }
        }
    }
}

impl From<AllocError> for GatewayError {
    fn from(err: AllocError) -> Self {
        match err {
            AllocError::Store(e) => e.into(),
            AllocError::File(e) => Self::SideEffect(e),
            other => Self::Allocation(other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn capacity_error_keeps_its_message() {
        let err = GatewayError::from(AllocError::CapacityExceeded {
            max: 2,
            cidr: "10.100.0.0/30".into(),
        });
        assert_eq!(err.reason(), ReasonCode::CapacityExceeded);
        assert_eq!(err.to_string(), "subnet 10.100.0.0/30 is at capacity (max 2 peers)");
    }

    #[test]
    fn store_duplicates_stay_distinguishable() {
        assert_eq!(
            GatewayError::from(StoreError::DuplicateName).reason(),
            ReasonCode::DuplicateName
        );
        assert_eq!(
            GatewayError::from(AllocError::Store(StoreError::DuplicateKey)).reason(),
            ReasonCode::DuplicateKey
        );
    }
}
