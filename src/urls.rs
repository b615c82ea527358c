use std::fs;
use std::path::Path;

use anyhow::{bail, Context, Result};
use tracing::info;

/// One URL of the universe, with its position and metadata.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UrlEntry {
    /// 0-based position in the universe; batch membership derives from it.
    pub index: usize,
    pub url: String,
    pub rank: u64,
    pub platform: Option<String>,
}

const SMOKE_URLS: &[&str] = &[
    "https://neetcode.io",
    "https://sport-exercise.ed.ac.uk/gym-memberships/bucs-universal-scheme",
    "https://www.zoopla.co.uk/to-rent/map/property/3-bedrooms/edinburgh-county/?keywords=hmo&price_frequency=per_month&price_max=1750&q=edinburgh&radius=3&search_source=to-rent",
    "https://gitlab.inria.fr/web-smartphone-privacy/Google-Tag-Manager-Hidden-Data-Leaks-and-its-Potential-Violations-under-EU-Data-Protection-Law",
];

const COMPREHENSIVE_EXTRA: &[&str] = &[
    "https://www.hdfcbank.com/personal/resources/learning-centre/pay/what-is-add-on-credit-card-and-its-working",
    "https://learn.microsoft.com/en-us/credentials/",
    "https://www.onthemarket.com/to-rent/3-bed-property/glasgow-central-/?max-price=1750&radius=3.0&view=map-only",
    "https://www.linkedin.com/company/coalition-inc",
    "https://www.rightmove.co.uk/property-to-rent/map.html?locationIdentifier=STATION%5E1652&maxBedrooms=3&minBedrooms=3&maxPrice=1750&radius=3.0",
    "https://www.amazon.co.uk/",
    "https://www.temu.com/",
    "https://www.comptia.org/en/",
    "https://www.ncsc.gov.uk/information/certified-training",
];

pub fn smoke_set() -> Vec<UrlEntry> {
    from_list(SMOKE_URLS.iter().copied())
}

pub fn comprehensive_set() -> Vec<UrlEntry> {
    from_list(SMOKE_URLS.iter().chain(COMPREHENSIVE_EXTRA).copied())
}

fn from_list<'a>(urls: impl Iterator<Item = &'a str>) -> Vec<UrlEntry> {
    urls.enumerate()
        .map(|(i, url)| UrlEntry {
            index: i,
            url: url.to_string(),
            rank: i as u64 + 1,
            platform: None,
        })
        .collect()
}

/// Load the URL universe from a CSV-like file.
///
/// An optional header row names the `url` (or `domain`/`website`), `rank` and
/// `platform` columns; without one, column 1 is the URL. Bare domains get an
/// `https://` prefix and missing ranks default to the 1-based position.
pub fn load_universe(path: &Path, limit: Option<usize>) -> Result<Vec<UrlEntry>> {
    let raw = fs::read_to_string(path)
        .with_context(|| format!("Failed to read URL list {}", path.display()))?;
    let entries = parse_universe(&raw, limit)?;
    info!("Loaded {} URLs from {}", entries.len(), path.display());
    Ok(entries)
}

pub fn parse_universe(raw: &str, limit: Option<usize>) -> Result<Vec<UrlEntry>> {
    let mut lines = raw.lines().filter(|l| !l.trim().is_empty()).peekable();

    let mut columns = Columns::default();
    if let Some(first) = lines.peek() {
        if let Some(header) = Columns::from_header(&split_row(first)) {
            columns = header;
            lines.next();
        }
    }

    let mut entries = Vec::new();
    for line in lines {
        if limit.is_some_and(|n| entries.len() >= n) {
            break;
        }
        let cells = split_row(line);
        let Some(raw_url) = cells.get(columns.url).filter(|c| !c.is_empty()) else {
            continue;
        };

        let index = entries.len();
        let rank = columns
            .rank
            .and_then(|i| cells.get(i))
            .and_then(|r| r.parse::<u64>().ok())
            .unwrap_or(index as u64 + 1);
        let platform = columns
            .platform
            .and_then(|i| cells.get(i))
            .filter(|p| !p.is_empty())
            .cloned();

        entries.push(UrlEntry {
            index,
            url: normalize_url(raw_url),
            rank,
            platform,
        });
    }

    if entries.is_empty() {
        bail!("URL list contains no URLs");
    }
    Ok(entries)
}

#[derive(Debug)]
struct Columns {
    url: usize,
    rank: Option<usize>,
    platform: Option<usize>,
}

impl Default for Columns {
    fn default() -> Self {
        Self {
            url: 0,
            rank: None,
            platform: None,
        }
    }
}

impl Columns {
    /// Interpret `cells` as a header row, if it is one.
    fn from_header(cells: &[String]) -> Option<Self> {
        let find = |names: &[&str]| {
            cells
                .iter()
                .position(|c| names.contains(&c.to_ascii_lowercase().as_str()))
        };
        let url = find(&["url", "domain", "website", "site", "origin"])?;
        Some(Self {
            url,
            rank: find(&["rank", "popularity", "position"]),
            platform: find(&["platform", "ecommerce_platform", "technology"]),
        })
    }
}

/// Split one CSV row. Commas inside double quotes stay in the field and `""`
/// inside quotes is a literal quote.
fn split_row(line: &str) -> Vec<String> {
    let mut cells = Vec::new();
    let mut cell = String::new();
    let mut quoted = false;
    let mut chars = line.chars().peekable();

    while let Some(c) = chars.next() {
        match c {
            '"' if quoted && chars.peek() == Some(&'"') => {
                cell.push('"');
                chars.next();
            }
            '"' => quoted = !quoted,
            ',' if !quoted => cells.push(std::mem::take(&mut cell).trim().to_string()),
            _ => cell.push(c),
        }
    }
    cells.push(cell.trim().to_string());
    cells
}

fn normalize_url(raw: &str) -> String {
    if raw.starts_with("http://") || raw.starts_with("https://") {
        raw.to_string()
    } else {
        format!("https://{}", raw.trim_start_matches("//"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_maps_columns() {
        let raw = "rank,domain,platform\n3,shop.example.com,Shopify\n7,https://b.example.org,\n";
        let urls = parse_universe(raw, None).unwrap();
        assert_eq!(urls.len(), 2);
        assert_eq!(urls[0].url, "https://shop.example.com");
        assert_eq!(urls[0].rank, 3);
        assert_eq!(urls[0].platform.as_deref(), Some("Shopify"));
        assert_eq!(urls[1].url, "https://b.example.org");
        assert_eq!(urls[1].platform, None);
        assert_eq!(urls[1].index, 1);
    }

    #[test]
    fn headerless_list_uses_first_column_and_position_rank() {
        let raw = "a.example\n\n\"b.example\",x\n";
        let urls = parse_universe(raw, None).unwrap();
        assert_eq!(urls.len(), 2);
        assert_eq!(urls[1].url, "https://b.example");
        assert_eq!(urls[1].rank, 2);
    }

    #[test]
    fn limit_truncates() {
        let raw = "url\na.example\nb.example\nc.example\n";
        assert_eq!(parse_universe(raw, Some(2)).unwrap().len(), 2);
    }

    #[test]
    fn empty_list_is_an_error() {
        assert!(parse_universe("url\n\n", None).is_err());
    }

    #[test]
    fn built_in_sets() {
        assert_eq!(smoke_set().len(), 4);
        assert_eq!(comprehensive_set().len(), 13);
        assert_eq!(comprehensive_set()[12].rank, 13);
    }

    #[test]
    fn quoted_fields_keep_their_commas() {
        let raw = "rank,url,platform\n1,\"shop.example.com\",\"Shopify, Plus\"\n2,b.example.org,\"Say \"\"hi\"\"\"\n";
        let urls = parse_universe(raw, None).unwrap();
        assert_eq!(urls[0].url, "https://shop.example.com");
        assert_eq!(urls[0].platform.as_deref(), Some("Shopify, Plus"));
        assert_eq!(urls[1].rank, 2);
        assert_eq!(urls[1].platform.as_deref(), Some("Say \"hi\""));
    }
}
