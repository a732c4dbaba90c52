//! Parsing of Kubernetes quantity strings (`10Gi`, `512M`, ...) and the JVM
//! heap sizing rule derived from the container memory limit.

use lazy_static::lazy_static;
use regex::Regex;

use std::fmt::{self, Display};

lazy_static! {
    static ref QUANTITY_REGEX: Regex =
        Regex::new(r"^(\d+)(Ei|Pi|Ti|Gi|Mi|Ki|E|P|T|G|M|K)?$").unwrap();
}

const MEBIBYTE: u128 = 1024 * 1024;

/// Heap never exceeds 31GiB, to stay under the JVM compressed-oops threshold.
const MAX_HEAP_BYTES: u128 = 31 * 1024 * 1024 * 1024;

#[derive(Debug, PartialEq, Clone)]
pub struct InvalidQuantity(pub String);

impl Display for InvalidQuantity {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "Invalid Kubernetes quantity: '{}'", self.0)
    }
}
impl std::error::Error for InvalidQuantity {}

/// Parses a Kubernetes quantity string into a byte count. Binary suffixes
/// (`Ki`..`Ei`) are powers of 1024, decimal suffixes (`K`..`E`) powers of
/// 1000, and a bare integer is a byte count.
pub fn parse_memory(quantity: &str) -> Result<u128, InvalidQuantity> {
    let captures = QUANTITY_REGEX
        .captures(quantity)
        .ok_or_else(|| InvalidQuantity(quantity.to_owned()))?;
    let digits: u128 = captures[1]
        .parse()
        .map_err(|_| InvalidQuantity(quantity.to_owned()))?;
    let multiplier: u128 = match captures.get(2).map(|m| m.as_str()) {
        None => 1,
        Some("Ki") => 1 << 10,
        Some("Mi") => 1 << 20,
        Some("Gi") => 1 << 30,
        Some("Ti") => 1 << 40,
        Some("Pi") => 1 << 50,
        Some("Ei") => 1 << 60,
        Some("K") => 1_000,
        Some("M") => 1_000_000,
        Some("G") => 1_000_000_000,
        Some("T") => 1_000_000_000_000,
        Some("P") => 1_000_000_000_000_000,
        Some("E") => 1_000_000_000_000_000_000,
        Some(_) => unreachable!("suffix alternatives are fixed by the regex"),
    };
    digits
        .checked_mul(multiplier)
        .ok_or_else(|| InvalidQuantity(quantity.to_owned()))
}

/// JVM heap for a given container memory limit: half the limit, capped at
/// 31GiB, expressed in whole megabytes as the JVM `-Xmx` flag expects.
pub fn heap_size(memory_limit: &str) -> Result<String, InvalidQuantity> {
    let limit = parse_memory(memory_limit)?;
    let heap_bytes = (limit / 2).min(MAX_HEAP_BYTES);
    Ok(format!("{}m", heap_bytes / MEBIBYTE))
}
