//! Quota / availability engine.
//!
//! One `Availability` per resource type tracks the remaining capacity and the
//! remaining required budget. Mutations are all-or-nothing: a reservation that
//! would drive either below zero fails and leaves the record untouched, unless
//! the quota is soft, in which case it is logged and clamped to zero.

use serde::{Deserialize, Serialize};
use smallvec::SmallVec;
use tracing::warn;

use crate::error::{PaasError, PaasResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum UnitFamily {
    /// Stored in millicores.
    Cores,
    /// Stored in bytes.
    Bytes,
}

impl UnitFamily {
    pub fn of(resource_type: &str) -> PaasResult<Self> {
        match resource_type {
            "cpu" => Ok(UnitFamily::Cores),
            "memory" | "storage" | "ephemeral-storage" => Ok(UnitFamily::Bytes),
            other => Err(PaasError::QuotasNotCompliant(format!("unsupported resource type `{}`", other))),
        }
    }

    /// Parse an absolute quantity, or a relative one (`"10%"`) against `reference`.
    pub fn parse(self, raw: &str, reference: Option<u64>) -> PaasResult<u64> {
        let raw = raw.trim();
        let invalid = || PaasError::QuotasNotCompliant(format!("invalid quantity `{}`", raw));
        if let Some(pct) = raw.strip_suffix('%') {
            let reference = reference.ok_or_else(|| {
                PaasError::QuotasNotCompliant(format!("relative quantity `{}` needs a reference capacity", raw))
            })?;
            let pct = parse_decimal(pct.trim(), 1_000).ok_or_else(invalid)?;
            return Ok(((reference as u128 * pct as u128) / 100_000) as u64);
        }
        match self {
            UnitFamily::Cores => match raw.strip_suffix('m') {
                Some(milli) => milli.parse::<u64>().map_err(|_| invalid()),
                None => parse_decimal(raw, 1_000).ok_or_else(invalid),
            },
            UnitFamily::Bytes => {
                let split = raw.find(|c: char| !(c.is_ascii_digit() || c == '.')).unwrap_or(raw.len());
                let (num, suffix) = raw.split_at(split);
                let mult = byte_multiplier(suffix).ok_or_else(invalid)?;
                parse_decimal(num, mult).ok_or_else(invalid)
            }
        }
    }

    pub fn format(self, value: u64) -> String {
        match self {
            UnitFamily::Cores if value % 1_000 == 0 => (value / 1_000).to_string(),
            UnitFamily::Cores => format!("{}m", value),
            UnitFamily::Bytes => {
                for (suffix, mult) in BINARY_SUFFIXES.iter().rev() {
                    if value >= *mult && value % *mult == 0 {
                        return format!("{}{}", value / mult, suffix);
                    }
                }
                value.to_string()
            }
        }
    }
}

const BINARY_SUFFIXES: [(&str, u64); 6] = [
    ("Ki", 1 << 10),
    ("Mi", 1 << 20),
    ("Gi", 1 << 30),
    ("Ti", 1 << 40),
    ("Pi", 1 << 50),
    ("Ei", 1 << 60),
];

fn byte_multiplier(suffix: &str) -> Option<u64> {
    if suffix.is_empty() { return Some(1); }
    if let Some((_, m)) = BINARY_SUFFIXES.iter().find(|(s, _)| *s == suffix) { return Some(*m); }
    match suffix {
        "k" | "K" => Some(1_000),
        "M" => Some(1_000_000),
        "G" => Some(1_000_000_000),
        "T" => Some(1_000_000_000_000),
        "P" => Some(1_000_000_000_000_000),
        "E" => Some(1_000_000_000_000_000_000),
        _ => None,
    }
}

/// `"1.5"` with `mult = 1000` gives 1500. Integer arithmetic only.
fn parse_decimal(num: &str, mult: u64) -> Option<u64> {
    if num.is_empty() { return None; }
    let (int, frac) = num.split_once('.').unwrap_or((num, ""));
    if int.is_empty() && frac.is_empty() { return None; }
    let int_v: u128 = if int.is_empty() { 0 } else { int.parse().ok()? };
    let mut total = int_v.checked_mul(mult as u128)?;
    if !frac.is_empty() {
        if !frac.chars().all(|c| c.is_ascii_digit()) { return None; }
        let digits = frac.len().min(18);
        let frac_v: u128 = frac[..digits].parse().ok()?;
        total += frac_v * mult as u128 / 10u128.pow(digits as u32);
    }
    u64::try_from(total).ok()
}

/// A quota as declared by an account, a job or a manifest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct QuotaDeclaration {
    #[serde(default)]
    pub category: Option<String>,
    #[serde(rename = "type")]
    pub resource_type: String,
    pub capacity: String,
    #[serde(default)]
    pub require: Option<String>,
    #[serde(default)]
    pub is_soft: bool,
}

/// Container-level allocation produced by a reservation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resource {
    #[serde(rename = "type")]
    pub resource_type: String,
    pub require: String,
    pub limit: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceSet {
    resources: SmallVec<[Resource; 2]>,
}

impl ResourceSet {
    pub fn push(&mut self, r: Resource) { self.resources.push(r); }
    pub fn iter(&self) -> impl Iterator<Item = &Resource> { self.resources.iter() }
    pub fn get(&self, resource_type: &str) -> Option<&Resource> {
        self.resources.iter().find(|r| r.resource_type == resource_type)
    }
    pub fn is_empty(&self) -> bool { self.resources.is_empty() }
    pub fn len(&self) -> usize { self.resources.len() }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Availability {
    resource_type: String,
    family: UnitFamily,
    /// Capacity at creation (or after the last `update`), used as the limit ceiling.
    ceiling: u64,
    capacity: u64,
    require: u64,
    is_soft: bool,
}

impl Availability {
    pub fn new(decl: &QuotaDeclaration) -> PaasResult<Self> {
        let family = UnitFamily::of(&decl.resource_type)?;
        let capacity = family.parse(&decl.capacity, None)?;
        let require = match &decl.require {
            Some(r) => family.parse(r, Some(capacity))?,
            None => capacity,
        };
        if require > capacity {
            return Err(PaasError::QuotasNotCompliant(format!(
                "require {} is greater than capacity {} for `{}`",
                family.format(require), family.format(capacity), decl.resource_type
            )));
        }
        Ok(Self { resource_type: decl.resource_type.clone(), family, ceiling: capacity, capacity, require, is_soft: decl.is_soft })
    }

    pub fn resource_type(&self) -> &str { &self.resource_type }
    pub fn family(&self) -> UnitFamily { self.family }
    pub fn capacity(&self) -> String { self.family.format(self.capacity) }
    pub fn require(&self) -> String { self.family.format(self.require) }
    pub fn capacity_value(&self) -> u64 { self.capacity }
    pub fn require_value(&self) -> u64 { self.require }
    pub fn is_soft(&self) -> bool { self.is_soft }

    /// Narrow this quota with another declaration (e.g. a per-cluster or
    /// per-manifest override). Relative values refer to the current capacity.
    /// A hard declaration always wins over a soft one.
    pub fn update(&mut self, decl: &QuotaDeclaration) -> PaasResult<()> {
        if decl.resource_type != self.resource_type || UnitFamily::of(&decl.resource_type)? != self.family {
            return Err(PaasError::QuotasNotCompliant(format!(
                "cannot merge `{}` into `{}`",
                decl.resource_type, self.resource_type
            )));
        }
        let capacity = self.family.parse(&decl.capacity, Some(self.capacity))?;
        if capacity > self.capacity {
            return Err(PaasError::QuotasNotCompliant(format!(
                "capacity {} for `{}` exceeds the available {}",
                self.family.format(capacity), self.resource_type, self.capacity()
            )));
        }
        let require = match &decl.require {
            Some(r) => self.family.parse(r, Some(capacity))?,
            None => capacity.min(self.require),
        };
        if require > self.require || require > capacity {
            return Err(PaasError::QuotasNotCompliant(format!(
                "require {} for `{}` exceeds the available {}",
                self.family.format(require), self.resource_type, self.require()
            )));
        }
        self.ceiling = capacity;
        self.capacity = capacity;
        self.require = require;
        self.is_soft = self.is_soft && decl.is_soft;
        Ok(())
    }

    /// Reserve `require` per replica, bounded by `limit`, and record it in `set`.
    /// Relative values are computed against the capacity remaining right now.
    pub fn reserve(&mut self, require: &str, limit: &str, replicas: u32, set: &mut ResourceSet) -> PaasResult<()> {
        let req = self.family.parse(require, Some(self.capacity))?;
        let lim = self.family.parse(limit, Some(self.capacity))?;
        if lim < req {
            return Err(PaasError::QuotasNotCompliant(format!(
                "limit {} is lower than require {} for `{}`",
                self.family.format(lim), self.family.format(req), self.resource_type
            )));
        }
        let total = req.checked_mul(replicas.max(1) as u64).unwrap_or(u64::MAX);
        if total > self.capacity || total > self.require || lim > self.ceiling {
            self.exceeded(total, lim)?;
        } else {
            self.capacity -= total;
            self.require -= total;
        }
        set.push(Resource {
            resource_type: self.resource_type.clone(),
            require: self.family.format(req),
            limit: self.family.format(lim),
        });
        Ok(())
    }

    /// Auto-size a container that declared nothing: a fair share of what is
    /// left, split over the `slots` container instances still waiting for one.
    pub fn update_resource(&mut self, set: &mut ResourceSet, slots: u32, replicas: u32) -> PaasResult<()> {
        let slots = slots.max(1) as u64;
        let share = self.require / slots;
        let limit = (self.capacity / slots).max(share);
        let total = share.saturating_mul(replicas.max(1) as u64);
        if share == 0 {
            self.exceeded(1, limit)?;
        } else {
            self.capacity -= total.min(self.capacity);
            self.require -= total.min(self.require);
        }
        set.push(Resource {
            resource_type: self.resource_type.clone(),
            require: self.family.format(share),
            limit: self.family.format(limit),
        });
        Ok(())
    }

    fn exceeded(&mut self, wanted: u64, limit: u64) -> PaasResult<()> {
        let msg = format!(
            "`{}` requires {} (limit {}) but only {} remains",
            self.resource_type,
            self.family.format(wanted),
            self.family.format(limit),
            self.capacity()
        );
        if !self.is_soft {
            return Err(PaasError::CapacityExceeded(msg));
        }
        warn!(resource = %self.resource_type, "soft quota exceeded: {}", msg);
        self.capacity = self.capacity.saturating_sub(wanted);
        self.require = self.require.saturating_sub(wanted);
        Ok(())
    }
}

/// Availabilities keyed by resource type, in declaration order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuotaSet {
    items: Vec<Availability>,
}

impl QuotaSet {
    pub fn from_declarations(decls: &[QuotaDeclaration]) -> PaasResult<Self> {
        let mut set = Self::default();
        set.merge(decls)?;
        Ok(set)
    }

    /// Merge declarations: known types are narrowed with `update`, new ones added.
    pub fn merge(&mut self, decls: &[QuotaDeclaration]) -> PaasResult<()> {
        for decl in decls {
            match self.items.iter_mut().find(|a| a.resource_type == decl.resource_type) {
                Some(existing) => existing.update(decl)?,
                None => self.items.push(Availability::new(decl)?),
            }
        }
        Ok(())
    }

    pub fn is_empty(&self) -> bool { self.items.is_empty() }
    pub fn iter(&self) -> impl Iterator<Item = &Availability> { self.items.iter() }
    pub fn get(&self, resource_type: &str) -> Option<&Availability> {
        self.items.iter().find(|a| a.resource_type == resource_type)
    }
    pub fn get_mut(&mut self, resource_type: &str) -> Option<&mut Availability> {
        self.items.iter_mut().find(|a| a.resource_type == resource_type)
    }
    pub fn types(&self) -> impl Iterator<Item = &str> { self.items.iter().map(|a| a.resource_type.as_str()) }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decl(t: &str, cap: &str, req: Option<&str>, soft: bool) -> QuotaDeclaration {
        QuotaDeclaration { category: None, resource_type: t.into(), capacity: cap.into(), require: req.map(Into::into), is_soft: soft }
    }

    #[test]
    fn parses_and_formats_quantities() {
        assert_eq!(UnitFamily::Cores.parse("500m", None).unwrap(), 500);
        assert_eq!(UnitFamily::Cores.parse("1.5", None).unwrap(), 1500);
        assert_eq!(UnitFamily::Cores.parse("2", None).unwrap(), 2000);
        assert_eq!(UnitFamily::Bytes.parse("512Mi", None).unwrap(), 512 << 20);
        assert_eq!(UnitFamily::Bytes.parse("1.5Gi", None).unwrap(), 3 << 29);
        assert_eq!(UnitFamily::Bytes.parse("2k", None).unwrap(), 2000);
        assert_eq!(UnitFamily::Bytes.parse("10%", Some(1000)).unwrap(), 100);
        assert!(UnitFamily::Bytes.parse("10%", None).is_err());
        assert!(UnitFamily::Bytes.parse("12Xi", None).is_err());
        assert_eq!(UnitFamily::Cores.format(1500), "1500m");
        assert_eq!(UnitFamily::Cores.format(3000), "3");
        assert_eq!(UnitFamily::Bytes.format(512 << 20), "512Mi");
        assert_eq!(UnitFamily::Bytes.format(1000), "1000");
    }

    #[test]
    fn reserve_decrements_and_records() {
        let mut a = Availability::new(&decl("cpu", "2", None, false)).unwrap();
        let mut set = ResourceSet::default();
        a.reserve("200m", "500m", 3, &mut set).unwrap();
        assert_eq!(a.capacity(), "1400m");
        assert_eq!(set.get("cpu").unwrap().require, "200m");
        assert_eq!(set.get("cpu").unwrap().limit, "500m");
    }

    #[test]
    fn failed_reservation_leaves_capacity_unchanged() {
        let mut a = Availability::new(&decl("memory", "1Gi", None, false)).unwrap();
        let mut set = ResourceSet::default();
        a.reserve("512Mi", "512Mi", 1, &mut set).unwrap();
        let err = a.reserve("300Mi", "300Mi", 2, &mut set).unwrap_err();
        assert!(matches!(err, PaasError::CapacityExceeded(_)));
        assert_eq!(a.capacity(), "512Mi");
        assert_eq!(set.len(), 1);
    }

    #[test]
    fn relative_requirements_use_remaining_capacity() {
        let mut a = Availability::new(&decl("memory", "1000", None, false)).unwrap();
        let mut set = ResourceSet::default();
        a.reserve("10%", "10%", 1, &mut set).unwrap();
        assert_eq!(a.capacity_value(), 900);
        a.reserve("10%", "10%", 1, &mut set).unwrap();
        assert_eq!(a.capacity_value(), 810);
    }

    #[test]
    fn soft_quota_clamps_to_zero() {
        let mut a = Availability::new(&decl("cpu", "1", None, true)).unwrap();
        let mut set = ResourceSet::default();
        a.reserve("2", "2", 1, &mut set).unwrap();
        assert_eq!(a.capacity_value(), 0);
        assert_eq!(set.len(), 1);
    }

    #[test]
    fn update_rejects_incompatible_or_larger_quotas() {
        let mut a = Availability::new(&decl("cpu", "4", None, false)).unwrap();
        assert!(matches!(a.update(&decl("memory", "1Gi", None, false)), Err(PaasError::QuotasNotCompliant(_))));
        assert!(matches!(a.update(&decl("cpu", "8", None, false)), Err(PaasError::QuotasNotCompliant(_))));
        a.update(&decl("cpu", "50%", None, true)).unwrap();
        assert_eq!(a.capacity(), "2");
        assert!(!a.is_soft(), "hard declaration stays authoritative");
    }

    #[test]
    fn limit_below_require_is_not_compliant() {
        let mut a = Availability::new(&decl("cpu", "4", None, false)).unwrap();
        let mut set = ResourceSet::default();
        assert!(matches!(a.reserve("1", "500m", 1, &mut set), Err(PaasError::QuotasNotCompliant(_))));
    }

    #[test]
    fn update_resource_shares_remaining_capacity() {
        let mut a = Availability::new(&decl("memory", "1Gi", None, false)).unwrap();
        let mut set = ResourceSet::default();
        a.update_resource(&mut set, 4, 1).unwrap();
        assert_eq!(set.get("memory").unwrap().require, "256Mi");
        assert_eq!(a.capacity(), "768Mi");
        let mut set2 = ResourceSet::default();
        a.update_resource(&mut set2, 3, 1).unwrap();
        assert_eq!(set2.get("memory").unwrap().require, "256Mi");
    }

    #[test]
    fn quota_set_merges_and_adds() {
        let mut qs = QuotaSet::from_declarations(&[decl("cpu", "4", None, false)]).unwrap();
        qs.merge(&[decl("cpu", "2", Some("1"), false), decl("memory", "1Gi", None, false)]).unwrap();
        assert_eq!(qs.types().collect::<Vec<_>>(), vec!["cpu", "memory"]);
        assert_eq!(qs.get("cpu").unwrap().require(), "1");
    }
}
