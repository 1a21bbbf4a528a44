//! Target selection policies over rate table candidates.
use rand::Rng;
use rand::seq::SliceRandom;
use rate_table::RateEntry;
use rate_table::types::AddressFamily;
use serde::Deserialize;
use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::str::FromStr;

const EARTH_RADIUS_KM: f64 = 6371.0;

pub const DEFAULT_RESOURCE: &str = "default";
pub const DEFAULT_TEMPLATE: &str = "https://{machine}/{path}";

#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum Policy {
    /// Nearest eligible target.
    Geo,
    /// Several nearby targets for the client to choose from.
    #[default]
    GeoOptions,
    Random,
    /// One target in the requested metro.
    Metro,
    /// Every eligible target.
    All,
}

impl Policy {
    pub const fn as_str(&self) -> &'static str {
        match self {
            Policy::Geo => "geo",
            Policy::GeoOptions => "geo_options",
            Policy::Random => "random",
            Policy::Metro => "metro",
            Policy::All => "all",
        }
    }

    /// Policy name the candidates are stored under in the rate table.
    pub const fn table_policy(&self) -> &'static str {
        match self {
            Policy::Metro | Policy::All => Policy::GeoOptions.as_str(),
            other => other.as_str(),
        }
    }
}

impl fmt::Display for Policy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Policy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "geo" => Ok(Policy::Geo),
            "geo_options" => Ok(Policy::GeoOptions),
            "random" => Ok(Policy::Random),
            "metro" => Ok(Policy::Metro),
            "all" => Ok(Policy::All),
            other => Err(format!("unknown policy '{other}'")),
        }
    }
}

/// What is known about the requesting client.
#[derive(Clone, Debug, Default)]
pub struct ClientInfo {
    pub ip: Option<String>,
    /// `(latitude, longitude)` in degrees.
    pub location: Option<(f64, f64)>,
    pub metro: Option<String>,
    pub af: Option<AddressFamily>,
}

fn default_max_results() -> usize {
    4
}

#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct SelectionConfig {
    #[serde(default = "default_max_results")]
    pub max_results: usize,
}

impl Default for SelectionConfig {
    fn default() -> Self {
        SelectionConfig {
            max_results: default_max_results(),
        }
    }
}

/// Great-circle distance in kilometres.
pub fn distance_km(a: (f64, f64), b: (f64, f64)) -> f64 {
    let (lat1, lon1) = (a.0.to_radians(), a.1.to_radians());
    let (lat2, lon2) = (b.0.to_radians(), b.1.to_radians());
    let dlat = lat2 - lat1;
    let dlon = lon2 - lon1;
    let h = (dlat / 2.0).sin().powi(2) + lat1.cos() * lat2.cos() * (dlon / 2.0).sin().powi(2);
    2.0 * EARTH_RADIUS_KM * h.sqrt().min(1.0).asin()
}

pub struct Selector {
    max_results: usize,
}

impl Selector {
    pub fn new(config: &SelectionConfig) -> Self {
        Selector {
            max_results: config.max_results.max(1),
        }
    }

    pub fn select<R: Rng>(
        &self,
        policy: Policy,
        candidates: Vec<RateEntry>,
        client: &ClientInfo,
        rng: &mut R,
    ) -> Vec<RateEntry> {
        let mut eligible: Vec<RateEntry> = candidates
            .into_iter()
            .filter(|entry| entry.matches_requester(client.ip.as_deref()))
            .filter(|entry| match (client.af, entry.af()) {
                (Some(wanted), Some(af)) => wanted == af,
                _ => true,
            })
            .collect();

        if policy == Policy::Metro {
            let Some(metro) = client.metro.as_deref() else {
                return Vec::new();
            };
            eligible.retain(|entry| entry.metro().eq_ignore_ascii_case(metro));
        }

        if policy == Policy::All {
            eligible.retain(|entry| entry.probability() > 0.0);
            eligible.sort_by(|a, b| a.key().cmp(b.key()));
            return eligible;
        }

        // Shuffle first so that ties in distance are broken at random.
        eligible.shuffle(rng);
        if matches!(policy, Policy::Geo | Policy::GeoOptions)
            && let Some(origin) = client.location
        {
            eligible.sort_by(|a, b| {
                let da = a.location().map(|loc| distance_km(origin, loc));
                let db = b.location().map(|loc| distance_km(origin, loc));
                match (da, db) {
                    (Some(da), Some(db)) => da.partial_cmp(&db).unwrap_or(Ordering::Equal),
                    (Some(_), None) => Ordering::Less,
                    (None, Some(_)) => Ordering::Greater,
                    (None, None) => Ordering::Equal,
                }
            });
        }

        let wanted = match policy {
            Policy::GeoOptions => self.max_results,
            _ => 1,
        };
        let mut selected = Vec::with_capacity(wanted);
        for entry in &eligible {
            if selected.len() == wanted {
                break;
            }
            if rng.random::<f64>() < entry.probability() {
                selected.push(entry.clone());
            }
        }
        // Every draw failed; an eligible target still exists, so weight one in.
        if selected.is_empty()
            && let Some(entry) = weighted_pick(&eligible, rng)
        {
            selected.push(entry.clone());
        }
        selected
    }
}

/// Picks one entry with chance proportional to its probability. Entries with
/// probability zero are never picked.
fn weighted_pick<'a, R: Rng>(entries: &'a [RateEntry], rng: &mut R) -> Option<&'a RateEntry> {
    let total: f64 = entries.iter().map(|entry| entry.probability()).sum();
    if total <= 0.0 {
        return None;
    }
    let mut point = rng.random::<f64>() * total;
    let mut last = None;
    for entry in entries.iter().filter(|entry| entry.probability() > 0.0) {
        if point < entry.probability() {
            return Some(entry);
        }
        point -= entry.probability();
        last = Some(entry);
    }
    last
}

/// Public description of a selected measurement target.
#[derive(Clone, Debug, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct Target {
    pub machine: String,
    pub urls: BTreeMap<String, String>,
}

/// Builds targets from per-service URL templates. `{machine}` expands to the
/// target address and `{path}` to the service name.
pub struct TargetBuilder {
    services: HashMap<String, BTreeMap<String, String>>,
}

impl TargetBuilder {
    pub fn new(services: HashMap<String, BTreeMap<String, String>>) -> Self {
        TargetBuilder { services }
    }

    pub fn build(&self, entry: &RateEntry) -> Target {
        let machine = entry.target_ip();
        let expand = |template: &str| {
            template
                .replace("{machine}", machine)
                .replace("{path}", entry.path())
        };
        let urls = match self.services.get(entry.path()) {
            Some(templates) if !templates.is_empty() => templates
                .iter()
                .map(|(resource, template)| (resource.clone(), expand(template)))
                .collect(),
            _ => BTreeMap::from([(DEFAULT_RESOURCE.to_string(), expand(DEFAULT_TEMPLATE))]),
        };
        Target {
            machine: machine.to_string(),
            urls,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand::rngs::StdRng;
    use rate_table::RawRow;

    fn entry(target_ip: &str, probability: f64, location: Option<(f64, f64)>) -> RateEntry {
        let (latitude, longitude) = match location {
            Some((lat, lon)) => (lat.to_string(), lon.to_string()),
            None => (String::new(), String::new()),
        };
        RateEntry::try_from(RawRow {
            path: "ndt_ssl".into(),
            policy: "geo_options".into(),
            target_ip: target_ip.into(),
            probability,
            requests_per_day: 100,
            latitude,
            longitude,
            ..Default::default()
        })
        .unwrap()
    }

    fn entry_with(row: RawRow) -> RateEntry {
        RateEntry::try_from(row).unwrap()
    }

    const NEW_YORK: (f64, f64) = (40.71, -74.0);
    const LONDON: (f64, f64) = (51.5, -0.12);
    const TOKYO: (f64, f64) = (35.68, 139.69);

    #[test]
    fn test_distance() {
        assert_eq!(distance_km(NEW_YORK, NEW_YORK), 0.0);
        let d = distance_km(NEW_YORK, LONDON);
        assert!((d - 5570.0).abs() < 30.0, "{d}");
        assert_eq!(distance_km(NEW_YORK, LONDON), distance_km(LONDON, NEW_YORK));
    }

    #[test]
    fn test_parse_policy() {
        assert_eq!("geo".parse::<Policy>(), Ok(Policy::Geo));
        assert_eq!("all".parse::<Policy>(), Ok(Policy::All));
        assert!("nearest".parse::<Policy>().is_err());
        assert_eq!(Policy::default(), Policy::GeoOptions);
        assert_eq!(Policy::Metro.table_policy(), "geo_options");
        assert_eq!(Policy::Geo.table_policy(), "geo");
    }

    #[test]
    fn test_geo_picks_nearest() {
        let selector = Selector::new(&SelectionConfig::default());
        let candidates = vec![
            entry("tokyo", 1.0, Some(TOKYO)),
            entry("london", 1.0, Some(LONDON)),
            entry("nowhere", 1.0, None),
        ];
        let client = ClientInfo {
            location: Some((48.85, 2.35)),
            ..Default::default()
        };

        let mut rng = StdRng::seed_from_u64(11);
        let selected = selector.select(Policy::Geo, candidates.clone(), &client, &mut rng);
        assert_eq!(selected.len(), 1);
        assert_eq!(selected[0].target_ip(), "london");

        let selected = selector.select(Policy::GeoOptions, candidates, &client, &mut rng);
        let order: Vec<_> = selected.iter().map(|e| e.target_ip()).collect();
        assert_eq!(order, vec!["london", "tokyo", "nowhere"]);
    }

    #[test]
    fn test_probability_zero_never_selected() {
        let selector = Selector::new(&SelectionConfig::default());
        let mut rng = StdRng::seed_from_u64(13);
        for _ in 0..100 {
            let candidates = vec![entry("off", 0.0, None), entry("on", 1.0, None)];
            let selected = selector.select(
                Policy::GeoOptions,
                candidates,
                &ClientInfo::default(),
                &mut rng,
            );
            assert_eq!(selected.len(), 1);
            assert_eq!(selected[0].target_ip(), "on");
        }

        let candidates = vec![entry("off", 0.0, None)];
        let selected = selector.select(Policy::All, candidates, &ClientInfo::default(), &mut rng);
        assert!(selected.is_empty());
    }

    #[test]
    fn test_eligible_target_always_selected() {
        let selector = Selector::new(&SelectionConfig::default());
        let mut rng = StdRng::seed_from_u64(17);
        for policy in [Policy::Geo, Policy::GeoOptions, Policy::Random] {
            for _ in 0..1000 {
                let selected = selector.select(
                    policy,
                    vec![entry("half", 0.5, None)],
                    &ClientInfo::default(),
                    &mut rng,
                );
                assert_eq!(selected.len(), 1, "{policy}");
                assert_eq!(selected[0].target_ip(), "half");
            }
        }
    }

    #[test]
    fn test_probability_weights_selection() {
        let selector = Selector::new(&SelectionConfig::default());
        let mut rng = StdRng::seed_from_u64(17);
        let (mut rare, mut common) = (0, 0);
        for _ in 0..2000 {
            let candidates = vec![entry("rare", 0.1, None), entry("common", 0.9, None)];
            let selected =
                selector.select(Policy::Random, candidates, &ClientInfo::default(), &mut rng);
            assert_eq!(selected.len(), 1);
            match selected[0].target_ip() {
                "rare" => rare += 1,
                _ => common += 1,
            }
        }
        assert!(rare > 0);
        assert!(common > rare * 3, "{common} vs {rare}");
    }

    #[test]
    fn test_weighted_pick_skips_zero_probability() {
        let mut rng = StdRng::seed_from_u64(31);
        let entries = vec![entry("off", 0.0, None), entry("low", 0.01, None)];
        for _ in 0..100 {
            let picked = weighted_pick(&entries, &mut rng).unwrap();
            assert_eq!(picked.target_ip(), "low");
        }
        assert!(weighted_pick(&[entry("off", 0.0, None)], &mut rng).is_none());
        assert!(weighted_pick(&[], &mut rng).is_none());
    }

    #[test]
    fn test_geo_options_limit() {
        let selector = Selector::new(&SelectionConfig { max_results: 2 });
        let candidates: Vec<_> = (0..5)
            .map(|i| entry(&format!("10.0.0.{i}"), 1.0, None))
            .collect();
        let mut rng = StdRng::seed_from_u64(19);
        let selected = selector.select(
            Policy::GeoOptions,
            candidates.clone(),
            &ClientInfo::default(),
            &mut rng,
        );
        assert_eq!(selected.len(), 2);

        let selected = selector.select(Policy::All, candidates, &ClientInfo::default(), &mut rng);
        assert_eq!(selected.len(), 5);
    }

    #[test]
    fn test_metro_filter() {
        let selector = Selector::new(&SelectionConfig::default());
        let candidates = vec![
            entry_with(RawRow {
                path: "ndt_ssl".into(),
                policy: "geo_options".into(),
                target_ip: "lga".into(),
                metro: "lga".into(),
                probability: 1.0,
                ..Default::default()
            }),
            entry_with(RawRow {
                path: "ndt_ssl".into(),
                policy: "geo_options".into(),
                target_ip: "lhr".into(),
                metro: "lhr".into(),
                probability: 1.0,
                ..Default::default()
            }),
        ];
        let mut rng = StdRng::seed_from_u64(23);

        let client = ClientInfo {
            metro: Some("LHR".into()),
            ..Default::default()
        };
        let selected = selector.select(Policy::Metro, candidates.clone(), &client, &mut rng);
        assert_eq!(selected.len(), 1);
        assert_eq!(selected[0].target_ip(), "lhr");

        // Metro policy without a metro selects nothing
        let selected = selector.select(Policy::Metro, candidates, &ClientInfo::default(), &mut rng);
        assert!(selected.is_empty());
    }

    #[test]
    fn test_requester_and_address_family_filters() {
        let selector = Selector::new(&SelectionConfig::default());
        let candidates = vec![
            entry_with(RawRow {
                path: "ndt_ssl".into(),
                policy: "geo_options".into(),
                requester_ip: "192.168.*".into(),
                target_ip: "private".into(),
                af: "ipv4".into(),
                probability: 1.0,
                ..Default::default()
            }),
            entry_with(RawRow {
                path: "ndt_ssl".into(),
                policy: "geo_options".into(),
                target_ip: "v6".into(),
                af: "ipv6".into(),
                probability: 1.0,
                ..Default::default()
            }),
        ];
        let mut rng = StdRng::seed_from_u64(29);

        let client = ClientInfo {
            ip: Some("192.168.1.1".into()),
            af: Some(AddressFamily::Ipv4),
            ..Default::default()
        };
        let selected = selector.select(Policy::All, candidates.clone(), &client, &mut rng);
        let ips: Vec<_> = selected.iter().map(|e| e.target_ip()).collect();
        assert_eq!(ips, vec!["private"]);

        let client = ClientInfo {
            ip: Some("10.1.1.1".into()),
            ..Default::default()
        };
        let selected = selector.select(Policy::All, candidates, &client, &mut rng);
        let ips: Vec<_> = selected.iter().map(|e| e.target_ip()).collect();
        assert_eq!(ips, vec!["v6"]);
    }

    #[test]
    fn test_target_urls() {
        let builder = TargetBuilder::new(HashMap::from([(
            "ndt_ssl".to_string(),
            BTreeMap::from([
                (
                    "download".to_string(),
                    "wss://{machine}:3010/ndt_protocol".to_string(),
                ),
                ("upload".to_string(), "wss://{machine}:3010/upload".to_string()),
            ]),
        )]));

        let target = builder.build(&entry("10.0.0.1", 1.0, None));
        assert_eq!(target.machine, "10.0.0.1");
        assert_eq!(target.urls["download"], "wss://10.0.0.1:3010/ndt_protocol");
        assert_eq!(target.urls.len(), 2);

        let other = entry_with(RawRow {
            path: "neubot".into(),
            policy: "geo".into(),
            target_ip: "10.0.0.2".into(),
            probability: 1.0,
            ..Default::default()
        });
        let target = builder.build(&other);
        assert_eq!(target.urls["default"], "https://10.0.0.2/neubot");
    }
}
