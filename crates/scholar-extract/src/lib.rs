//! Field extractors for scholar profile listings and citation detail pages.

use scholar_core::{Citation, ProfileInfo, PublicationRecord, SITE_ORIGIN};
use scraper::{ElementRef, Html, Selector};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::debug;

pub const CRATE_NAME: &str = "scholar-extract";

pub const PROFILE_HEADER: &str = "div#gsc_prf";
pub const PROFILE_NAME: &str = "div#gsc_prf_in";
pub const PROFILE_TITLE: &str = "div.gsc_prf_il";
pub const PROFILE_AVATAR: &str = "#gsc_prf_pua img";

pub const LISTING_ROW: &str = "tr.gsc_a_tr";
pub const ROW_TITLE: &str = "a.gsc_a_at";
pub const ROW_GRAY: &str = "div.gs_gray";
pub const ROW_CITATION: &str = "a.gsc_a_ac";
pub const ROW_YEAR: &str = "td.gsc_a_y";

pub const DETAIL_PANEL: &str = "div#gsc_vcpb";
pub const DETAIL_EXTERNAL_LINK: &str = "div#gsc_oci_title_gg a";
pub const DETAIL_FIELD_PAIR: &str = "div.gs_scl";
pub const DETAIL_FIELD_LABEL: &str = "div.gsc_oci_field";
pub const DETAIL_FIELD_VALUE: &str = "div.gsc_oci_value";
pub const DETAIL_DESCRIPTION: &str = "div#gsc_oci_descr";

#[derive(Debug, Error)]
pub enum ExtractError {
    #[error("invalid selector `{selector}`: {message}")]
    Selector { selector: String, message: String },
}

/// Options shared by every extractor in one run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtractContext {
    pub site_origin: String,
}

impl Default for ExtractContext {
    fn default() -> Self {
        Self {
            site_origin: SITE_ORIGIN.to_string(),
        }
    }
}

/// Reads a fixed set of named fields out of one document sub-tree.
///
/// Extraction runs eagerly on construction. A field whose element is missing
/// is left unset; it is never stored as an empty placeholder.
pub trait FieldExtractor: Sized {
    type Output;

    fn extract_from(element: ElementRef<'_>, ctx: &ExtractContext) -> Result<Self, ExtractError>;

    /// Checks only the fields the record's identity depends on.
    fn is_valid(&self) -> bool;

    /// Borrowed view of what has been read so far.
    fn fields(&self) -> &Self::Output;

    /// Hands the accumulated fields to the caller for emission.
    fn extract(self) -> Self::Output;
}

fn selector(css: &str) -> Result<Selector, ExtractError> {
    Selector::parse(css).map_err(|e| ExtractError::Selector {
        selector: css.to_string(),
        message: e.to_string(),
    })
}

fn text_or_none(value: String) -> Option<String> {
    let trimmed = value.trim().to_string();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed)
    }
}

/// Page text exactly as rendered; only a truly empty string counts as absent.
fn verbatim_or_none(value: String) -> Option<String> {
    if value.is_empty() {
        None
    } else {
        Some(value)
    }
}

fn element_text(element: ElementRef<'_>) -> String {
    element.text().collect::<String>()
}

fn attr_or_none(element: ElementRef<'_>, attr: &str) -> Option<String> {
    element
        .value()
        .attr(attr)
        .and_then(|s| text_or_none(s.to_string()))
}

fn select_first<'a>(scope: ElementRef<'a>, css: &str) -> Result<Option<ElementRef<'a>>, ExtractError> {
    let sel = selector(css)?;
    Ok(scope.select(&sel).next())
}

fn select_all<'a>(scope: ElementRef<'a>, css: &str) -> Result<Vec<ElementRef<'a>>, ExtractError> {
    let sel = selector(css)?;
    Ok(scope.select(&sel).collect())
}

fn select_first_text(scope: ElementRef<'_>, css: &str) -> Result<Option<String>, ExtractError> {
    Ok(select_first(scope, css)?.and_then(|n| text_or_none(element_text(n))))
}

fn select_first_verbatim(scope: ElementRef<'_>, css: &str) -> Result<Option<String>, ExtractError> {
    Ok(select_first(scope, css)?.and_then(|n| verbatim_or_none(element_text(n))))
}

fn select_first_attr(
    scope: ElementRef<'_>,
    css: &str,
    attr: &str,
) -> Result<Option<String>, ExtractError> {
    Ok(select_first(scope, css)?.and_then(|n| attr_or_none(n, attr)))
}

/// Rewrites a site-relative path onto the origin; anything else passes through.
pub fn absolutize_link(href: &str, site_origin: &str) -> String {
    if href.starts_with('/') {
        format!("{}{}", site_origin.trim_end_matches('/'), href)
    } else {
        href.to_string()
    }
}

/// The page-local id is whatever follows the last `=` of the row link, or the
/// whole link when it has none.
pub fn local_id_from_link(link: &str) -> Option<String> {
    link.rsplit('=')
        .next()
        .filter(|id| !id.is_empty())
        .map(str::to_string)
}

/// Pulls the `cluster` query parameter out of an href.
pub fn cluster_id_from_href(href: &str) -> Option<String> {
    let query = href.split_once('?').map(|(_, q)| q).unwrap_or(href);
    query
        .split('&')
        .find_map(|part| part.strip_prefix("cluster="))
        .map(|id| id.split('#').next().unwrap_or(id).to_string())
        .filter(|id| !id.is_empty())
}

/// Content fingerprint of a publication, independent of page structure.
pub fn identity_hash(title: &str, year: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(format!("{title} - {year}").as_bytes());
    hex::encode(hasher.finalize())
}

#[derive(Debug, Clone, Default)]
pub struct ProfileInfoExtractor {
    info: ProfileInfo,
}

impl ProfileInfoExtractor {
    fn read_name(header: ElementRef<'_>) -> Result<Option<String>, ExtractError> {
        select_first_text(header, PROFILE_NAME)
    }

    fn read_title(header: ElementRef<'_>) -> Result<Option<String>, ExtractError> {
        select_first_text(header, PROFILE_TITLE)
    }

    fn read_avatar(header: ElementRef<'_>) -> Result<Option<String>, ExtractError> {
        select_first_attr(header, PROFILE_AVATAR, "src")
    }
}

impl FieldExtractor for ProfileInfoExtractor {
    type Output = ProfileInfo;

    fn extract_from(header: ElementRef<'_>, _ctx: &ExtractContext) -> Result<Self, ExtractError> {
        Ok(Self {
            info: ProfileInfo {
                name: Self::read_name(header)?,
                title: Self::read_title(header)?,
                avatar: Self::read_avatar(header)?,
            },
        })
    }

    /// Profile metadata is singular per run and has no identity requirement.
    fn is_valid(&self) -> bool {
        true
    }

    fn fields(&self) -> &ProfileInfo {
        &self.info
    }

    fn extract(self) -> ProfileInfo {
        self.info
    }
}

/// Extended fields read from one citation detail panel.
#[derive(Debug, Clone, Default)]
pub struct RecordDetailExtractor {
    record: PublicationRecord,
}

impl RecordDetailExtractor {
    fn read_external_link(panel: ElementRef<'_>) -> Result<PublicationRecord, ExtractError> {
        let Some(anchor) = select_first(panel, DETAIL_EXTERNAL_LINK)? else {
            return Ok(PublicationRecord::default());
        };
        Ok(PublicationRecord {
            ext_text: text_or_none(element_text(anchor)),
            ext_link: attr_or_none(anchor, "href"),
            ..Default::default()
        })
    }

    /// Label text is matched by substring, the way the page words them
    /// ("Authors", "Publication date", "Scholar articles").
    fn read_field_pairs(panel: ElementRef<'_>) -> Result<PublicationRecord, ExtractError> {
        let mut patch = PublicationRecord::default();
        for pair in select_all(panel, DETAIL_FIELD_PAIR)? {
            let Some(label) = select_first(pair, DETAIL_FIELD_LABEL)? else {
                continue;
            };
            let Some(value) = select_first(pair, DETAIL_FIELD_VALUE)? else {
                continue;
            };
            let label = element_text(label);

            if label.contains("Authors") {
                patch.authors = text_or_none(element_text(value));
            }
            if label.contains("date") {
                patch.pub_date = text_or_none(element_text(value));
            }
            if label.contains("articles") {
                let cluster = select_all(value, "a[href]")?
                    .into_iter()
                    .filter_map(|a| a.value().attr("href"))
                    .find_map(cluster_id_from_href);
                if cluster.is_some() {
                    patch.id = cluster;
                }
            }
        }
        Ok(patch)
    }

    fn read_description(panel: ElementRef<'_>) -> Result<PublicationRecord, ExtractError> {
        Ok(PublicationRecord {
            desc: select_first_text(panel, DETAIL_DESCRIPTION)?,
            ..Default::default()
        })
    }
}

impl FieldExtractor for RecordDetailExtractor {
    type Output = PublicationRecord;

    fn extract_from(panel: ElementRef<'_>, _ctx: &ExtractContext) -> Result<Self, ExtractError> {
        let record = Self::read_external_link(panel)?
            .merged(Self::read_field_pairs(panel)?)
            .merged(Self::read_description(panel)?);
        Ok(Self { record })
    }

    /// The cluster id is the cross-reference key for an enriched record.
    fn is_valid(&self) -> bool {
        self.record.has_cluster_id()
    }

    fn fields(&self) -> &PublicationRecord {
        &self.record
    }

    fn extract(self) -> PublicationRecord {
        self.record
    }
}

/// Summary fields read from one listing row.
#[derive(Debug, Clone, Default)]
pub struct RecordSummaryExtractor {
    record: PublicationRecord,
    enriched: bool,
}

impl RecordSummaryExtractor {
    fn read_title_link(row: ElementRef<'_>, ctx: &ExtractContext) -> Result<PublicationRecord, ExtractError> {
        let Some(anchor) = select_first(row, ROW_TITLE)? else {
            return Ok(PublicationRecord::default());
        };
        let link = attr_or_none(anchor, "href").map(|href| absolutize_link(&href, &ctx.site_origin));
        let local_id = link.as_deref().and_then(local_id_from_link);
        Ok(PublicationRecord {
            title: verbatim_or_none(element_text(anchor)),
            link,
            local_id,
            ..Default::default()
        })
    }

    /// Positional contract: the first gray block is the author list and the
    /// second, when rendered, is the venue. This mirrors the listing layout
    /// and breaks if the site reorders those blocks.
    fn read_gray_blocks(row: ElementRef<'_>) -> Result<PublicationRecord, ExtractError> {
        let grays = select_all(row, ROW_GRAY)?;
        Ok(PublicationRecord {
            authors: grays.first().and_then(|g| text_or_none(element_text(*g))),
            venue: grays.get(1).and_then(|g| text_or_none(element_text(*g))),
            ..Default::default()
        })
    }

    fn read_citation(row: ElementRef<'_>) -> Result<PublicationRecord, ExtractError> {
        let Some(anchor) = select_first(row, ROW_CITATION)? else {
            return Ok(PublicationRecord::default());
        };
        Ok(match verbatim_or_none(element_text(anchor)) {
            None => PublicationRecord {
                citation: Some(Citation::Zero),
                ..Default::default()
            },
            Some(count) => PublicationRecord {
                citation: Some(Citation::Count(count)),
                citation_link: attr_or_none(anchor, "href"),
                ..Default::default()
            },
        })
    }

    fn read_year(row: ElementRef<'_>) -> Result<PublicationRecord, ExtractError> {
        Ok(PublicationRecord {
            year: select_first_verbatim(row, ROW_YEAR)?,
            ..Default::default()
        })
    }

    pub fn local_id(&self) -> Option<&str> {
        self.record.local_id.as_deref()
    }

    pub fn is_enriched(&self) -> bool {
        self.enriched
    }

    /// Merges a parsed detail panel over the summary fields.
    pub fn enrich(&mut self, detail: RecordDetailExtractor) {
        self.record.merge(detail.extract());
        self.enriched = true;
    }
}

impl FieldExtractor for RecordSummaryExtractor {
    type Output = PublicationRecord;

    fn extract_from(row: ElementRef<'_>, ctx: &ExtractContext) -> Result<Self, ExtractError> {
        let record = Self::read_title_link(row, ctx)?
            .merged(Self::read_year(row)?)
            .merged(Self::read_citation(row)?)
            .merged(Self::read_gray_blocks(row)?);
        Ok(Self {
            record,
            enriched: false,
        })
    }

    /// A row without its view parameter cannot be cross-referenced, and a row
    /// without a title or year cannot be emitted or hashed. An enriched row
    /// additionally needs its cluster id.
    fn is_valid(&self) -> bool {
        let base =
            self.record.has_local_id() && self.record.has_title() && self.record.has_year();
        if self.enriched {
            base && self.record.has_cluster_id()
        } else {
            base
        }
    }

    fn fields(&self) -> &PublicationRecord {
        &self.record
    }

    /// Only enriched rows get a `hash_id`; summary-only rows are emitted
    /// without one, so a run without detail enrichment never outputs it.
    fn extract(mut self) -> PublicationRecord {
        if self.enriched {
            let hash = identity_hash(
                self.record.title.as_deref().unwrap_or_default(),
                self.record.year.as_deref().unwrap_or_default(),
            );
            self.record.hash_id = Some(hash);
        }
        self.record
    }
}

/// Everything parsed from one rendered listing document.
#[derive(Debug, Clone, Default)]
pub struct ListingSnapshot {
    pub profile: ProfileInfoExtractor,
    pub rows: Vec<RecordSummaryExtractor>,
}

/// Parse the profile header and every listing row, in document order.
pub fn parse_listing(html: &str, ctx: &ExtractContext) -> Result<ListingSnapshot, ExtractError> {
    let document = Html::parse_document(html);
    let root = document.root_element();

    let profile = match select_first(root, PROFILE_HEADER)? {
        Some(header) => ProfileInfoExtractor::extract_from(header, ctx)?,
        None => {
            debug!("profile header not rendered");
            ProfileInfoExtractor::default()
        }
    };

    let rows = select_all(root, LISTING_ROW)?
        .into_iter()
        .map(|row| RecordSummaryExtractor::extract_from(row, ctx))
        .collect::<Result<Vec<_>, _>>()?;

    Ok(ListingSnapshot { profile, rows })
}

/// What a fetched detail page turned out to be.
#[derive(Debug, Clone)]
pub enum DetailPage {
    /// The title carried the not-found marker.
    NotFound,
    /// The page loaded but the detail panel was never rendered.
    MissingPanel,
    Parsed(RecordDetailExtractor),
}

pub fn parse_detail_page(
    title: Option<&str>,
    html: &str,
    not_found_marker: &str,
    ctx: &ExtractContext,
) -> Result<DetailPage, ExtractError> {
    if title.is_some_and(|t| t.contains(not_found_marker)) {
        return Ok(DetailPage::NotFound);
    }
    let document = Html::parse_document(html);
    match select_first(document.root_element(), DETAIL_PANEL)? {
        Some(panel) => Ok(DetailPage::Parsed(RecordDetailExtractor::extract_from(panel, ctx)?)),
        None => Ok(DetailPage::MissingPanel),
    }
}
