// Copyright (C) 2025 Joseph Sacchini
//
// This program is free software: you can redistribute it and/or modify it under
// the terms of the GNU Affero General Public License as published by the Free
// Software Foundation, version 3.
//
// This program is distributed in the hope that it will be useful, but WITHOUT
// ANY WARRANTY; without even the implied warranty of MERCHANTABILITY or FITNESS
// FOR A PARTICULAR PURPOSE. See the GNU Affero General Public License for more
// details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program. If not, see <https://www.gnu.org/licenses/>.

use std::net::Ipv4Addr;

use ipnetwork::Ipv4Network;
use sqlx::SqliteConnection;
use tracing::info;

use crate::address::{AddressError, Subnet};
use crate::db::StoreError;
use crate::db::peer;
use crate::files::FileError;
use crate::ledger::Ledger;
use crate::mirror::MirrorDir;
use crate::shared::SharedConfig;

#[derive(Debug, thiserror::Error)]
pub enum AllocError {
    #[error("no free addresses left in {cidr}")]
    SubnetFull { cidr: String },

    #[error("subnet {cidr} is at capacity (max {max} peers)")]
    CapacityExceeded { max: u32, cidr: String },

    #[error("{addr} is outside subnet {cidr}")]
    OutsideSubnet { addr: Ipv4Addr, cidr: String },

    #[error("{0} is reserved")]
    Reserved(Ipv4Addr),

    #[error("{0} is already in use")]
    InUse(Ipv4Addr),

    #[error(transparent)]
    Address(#[from] AddressError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    File(#[from] FileError),
}

/// Choose an address from `ledger`: validate `requested`, or take the lowest
/// free host above the gateway.
pub fn pick(
    subnet: &Subnet,
    ledger: &Ledger,
    requested: Option<&str>,
) -> Result<Ipv4Addr, AllocError> {
    let Some(requested) = requested else {
        return subnet
            .peer_hosts()
            .find(|host| !ledger.contains(*host))
            .ok_or_else(|| AllocError::SubnetFull {
                cidr: subnet.to_string(),
            });
    };

    let addr = subnet.resolve_candidate(requested)?;
    if !subnet.contains(addr) {
        return Err(AllocError::OutsideSubnet {
            addr,
            cidr: subnet.to_string(),
        });
    }
    if subnet.is_reserved(addr) {
        return Err(AllocError::Reserved(addr));
    }
    if ledger.contains(addr) {
        return Err(AllocError::InUse(addr));
    }
    Ok(addr)
}

/// Allocate an address for a new peer on the caller's open transaction.
///
/// The result carries the subnet prefix (client view). Callers must hold the
/// allocation lock: the mirror directory scan is not covered by the
/// transaction.
pub async fn allocate(
    conn: &mut SqliteConnection,
    subnet: &Subnet,
    requested: Option<&str>,
    mirror: &MirrorDir,
    shared: &SharedConfig,
) -> Result<Ipv4Network, AllocError> {
    let count = peer::count_peers(conn).await?;
    let max = subnet.capacity();
    if count >= i64::from(max) {
        return Err(AllocError::CapacityExceeded {
            max,
            cidr: subnet.to_string(),
        });
    }

    let stored = peer::peer_addresses(conn).await?;
    let ledger = Ledger::gather(subnet, &stored, mirror, shared)?;
    let host = pick(subnet, &ledger, requested)?;
    info!(%host, %subnet, requested, "allocated address");

    Ipv4Network::new(host, subnet.prefix())
        .map_err(|_| AddressError::InvalidAddress(host.to_string()).into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    fn subnet() -> Subnet {
        Subnet::parse("10.100.0.0/24").unwrap()
    }

    fn ledger(taken: &[u8]) -> Ledger {
        Ledger::from_parts(
            taken.iter().map(|o| Ipv4Addr::new(10, 100, 0, *o)),
            [],
            Ipv4Addr::new(10, 100, 0, 1),
        )
    }

    #[test]
    fn lowest_free_address() {
        assert_eq!(
            pick(&subnet(), &ledger(&[2, 3, 5]), None).unwrap(),
            Ipv4Addr::new(10, 100, 0, 4)
        );
    }

    #[test_case("7" ; "bare octet")]
    #[test_case("10.100.0.7" ; "dotted")]
    #[test_case("10.100.0.7/24" ; "with prefix")]
    fn requested_address_accepted(requested: &str) {
        assert_eq!(
            pick(&subnet(), &ledger(&[2]), Some(requested)).unwrap(),
            Ipv4Addr::new(10, 100, 0, 7)
        );
    }

    #[test]
    fn requested_in_use_never_reassigned() {
        let err = pick(&subnet(), &ledger(&[2, 7]), Some("7")).unwrap_err();
        assert!(matches!(err, AllocError::InUse(a) if a == Ipv4Addr::new(10, 100, 0, 7)));
    }

    #[test_case("0" ; "network")]
    #[test_case("255" ; "broadcast")]
    #[test_case("10.100.0.1" ; "gateway")]
    fn reserved_rejected(requested: &str) {
        let err = pick(&subnet(), &Ledger::default(), Some(requested)).unwrap_err();
        assert!(matches!(err, AllocError::Reserved(_)));
    }

    #[test]
    fn outside_rejected() {
        let err = pick(&subnet(), &ledger(&[]), Some("10.101.0.7")).unwrap_err();
        assert!(matches!(err, AllocError::OutsideSubnet { .. }));
    }

    #[test]
    fn garbage_rejected() {
        let err = pick(&subnet(), &ledger(&[]), Some("laptop")).unwrap_err();
        assert!(matches!(err, AllocError::Address(AddressError::InvalidAddress(_))));
    }

    #[test]
    fn full_subnet() {
        let small = Subnet::parse("10.100.0.0/29").unwrap();
        let taken = Ledger::from_parts(
            (2..=6).map(|o| Ipv4Addr::new(10, 100, 0, o)),
            [],
            small.gateway(),
        );
        let err = pick(&small, &taken, None).unwrap_err();
        assert_eq!(err.to_string(), "no free addresses left in 10.100.0.0/29");
    }

    #[test_case("10.100.0.0/30" ; "slash 30")]
    #[test_case("10.100.0.0/28" ; "slash 28")]
    #[test_case("10.100.0.0/24" ; "slash 24")]
    fn sequential_allocation_is_distinct(cidr: &str) {
        let subnet = Subnet::parse(cidr).unwrap();
        let mut taken = Vec::new();
        for _ in 0..subnet.capacity() - 1 {
            let ledger = Ledger::from_parts(taken.clone(), [], subnet.gateway());
            let addr = pick(&subnet, &ledger, None).unwrap();
            assert!(subnet.contains(addr));
            assert!(!subnet.is_reserved(addr));
            assert!(!taken.contains(&addr));
            taken.push(addr);
        }
        let ledger = Ledger::from_parts(taken, [], subnet.gateway());
        assert!(matches!(
            pick(&subnet, &ledger, None),
            Err(AllocError::SubnetFull { .. })
        ));
    }
}
