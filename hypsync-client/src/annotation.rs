//! Decoded view over one annotation row from the server.

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};

use crate::error::{Error, Result};

/// One annotation as returned by the search and annotation endpoints.
///
/// Typed fields cover what the engine works with; everything else the server
/// sends is retained in `extra` so a persisted record reproduces the row.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Annotation {
    /// Opaque server-assigned identifier, stable across updates.
    pub id: String,
    /// Visibility scope the annotation belongs to.
    pub group: String,
    /// Account string, usually `acct:{username}@{domain}`.
    #[serde(default)]
    pub user: String,
    /// Creation timestamp, RFC 3339.
    pub created: String,
    /// Last-edit timestamp, RFC 3339. Strictly increasing per `id`.
    pub updated: String,
    /// Document address the annotation is anchored to.
    #[serde(default)]
    pub uri: String,
    /// Free-form body text.
    #[serde(default)]
    pub text: String,
    /// Tags, whitespace-trimmed on decode.
    #[serde(default, deserialize_with = "trimmed_tags")]
    pub tags: Vec<String>,
    /// Ancestor ids, root first; the last element is the direct parent.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub references: Vec<String>,
    /// Anchoring targets with their selectors.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub target: Vec<Target>,
    /// Document metadata sub-record.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub document: Option<Document>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Classification derived from references and selectors.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Kind {
    /// Anchored to a selection within a document.
    Annotation,
    /// Part of a thread under another annotation.
    Reply,
    /// Anchored to a document as a whole, no selector.
    Pagenote,
}

/// One anchoring target within an annotation.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Target {
    /// Bare document address, used when no selector exists.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub scope: Vec<String>,
    /// Raw selector objects; see the typed accessors on [`Annotation`].
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub selector: Vec<Value>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Document sub-record: title, filename, link list.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Document {
    /// Title as sent by the server, either a string or a list of strings.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filename: Option<String>,
    /// Link list; some rows carry a single object or a bare string here.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub link: Option<Value>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Document {
    /// Hrefs of the document links, tolerating the non-list shapes.
    pub fn links(&self) -> Vec<&str> {
        match &self.link {
            Some(Value::Array(items)) => items
                .iter()
                .filter_map(|item| item.get("href").and_then(Value::as_str))
                .collect(),
            Some(Value::Object(map)) => {
                map.get("href").and_then(Value::as_str).into_iter().collect()
            }
            Some(Value::String(href)) => vec![href.as_str()],
            _ => Vec::new(),
        }
    }
}

/// A text-quote anchor: surrounding context plus the quoted span.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct TextQuote {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prefix: Option<String>,
    pub exact: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub suffix: Option<String>,
}

impl Annotation {
    /// Decodes a raw server row.
    pub fn from_row(row: Value) -> Result<Self> {
        serde_json::from_value(row).map_err(Error::from)
    }

    /// Reply iff `references` is non-empty; otherwise annotation iff any
    /// target carries a selector; otherwise page note.
    pub fn kind(&self) -> Kind {
        if !self.references.is_empty() {
            Kind::Reply
        } else if self.target.iter().any(|t| !t.selector.is_empty()) {
            Kind::Annotation
        } else {
            Kind::Pagenote
        }
    }

    /// Direct parent id, when this is a reply.
    pub fn parent_id(&self) -> Option<&str> {
        self.references.last().map(String::as_str)
    }

    /// Username with the `acct:` wrapping stripped.
    pub fn username(&self) -> &str {
        let user = self.user.strip_prefix("acct:").unwrap_or(&self.user);
        user.split('@').next().unwrap_or(user)
    }

    fn selectors(&self) -> impl Iterator<Item = &Value> {
        self.target.iter().flat_map(|t| t.selector.iter())
    }

    fn selector_of_type(&self, name: &str) -> Option<&Value> {
        self.selectors()
            .find(|s| s.get("type").and_then(Value::as_str) == Some(name))
    }

    /// First text-quote selector across the targets.
    pub fn quote(&self) -> Option<TextQuote> {
        let selector = self.selector_of_type("TextQuoteSelector")?;
        Some(TextQuote {
            prefix: selector
                .get("prefix")
                .and_then(Value::as_str)
                .map(str::to_owned),
            exact: selector.get("exact").and_then(Value::as_str)?.to_owned(),
            suffix: selector
                .get("suffix")
                .and_then(Value::as_str)
                .map(str::to_owned),
        })
    }

    /// Start and end offsets of the first text-position selector.
    pub fn position(&self) -> Option<(u64, u64)> {
        let selector = self.selector_of_type("TextPositionSelector")?;
        Some((
            selector.get("start").and_then(Value::as_u64)?,
            selector.get("end").and_then(Value::as_u64)?,
        ))
    }

    /// Value of the first fragment selector.
    pub fn fragment(&self) -> Option<&str> {
        self.selector_of_type("FragmentSelector")?
            .get("value")
            .and_then(Value::as_str)
    }

    /// Address to show for this annotation.
    ///
    /// Proxy prefixes are stripped, and `urn:x-pdf:` addresses resolve
    /// through the document links, falling back to the document filename.
    pub fn display_uri(&self) -> String {
        let mut uri = self
            .uri
            .strip_prefix("https://via.hypothes.is/h/")
            .or_else(|| self.uri.strip_prefix("https://via.hypothes.is/"))
            .unwrap_or(&self.uri)
            .to_owned();

        if uri.starts_with("urn:x-pdf")
            && let Some(document) = &self.document
        {
            if let Some(href) = document.links().iter().find(|h| !h.starts_with("urn:")) {
                uri = (*href).to_owned();
            } else if let Some(filename) = &document.filename {
                uri = filename.clone();
            }
        }
        uri
    }

    /// Document title, falling back to the display address; never empty.
    pub fn doc_title(&self) -> String {
        let title = self.document.as_ref().and_then(|d| match &d.title {
            Some(Value::String(t)) => Some(t.clone()),
            Some(Value::Array(items)) => items.first().and_then(Value::as_str).map(str::to_owned),
            _ => None,
        });
        let title = title.unwrap_or_else(|| self.display_uri()).replace('"', "'");
        if title.is_empty() {
            "untitled".to_owned()
        } else {
            title
        }
    }
}

/// Canonical form of a document address for indexing.
///
/// Strips the proxy prefixes, the `hypothesisAnnotationId` query segment, and
/// the scheme, so that the same page reached different ways lands on one key.
pub fn normalize_uri(uri: &str) -> String {
    let uri = uri
        .strip_prefix("https://via.hypothes.is/h/")
        .or_else(|| uri.strip_prefix("https://via.hypothes.is/"))
        .unwrap_or(uri);
    let uri = match uri.find("?hypothesisAnnotationId=") {
        Some(at) => &uri[..at],
        None => uri,
    };
    let uri = match uri.find("://") {
        Some(at) => &uri[at + 3..],
        None => uri,
    };
    uri.to_owned()
}

/// Public share link for an annotation id.
pub fn share_link_from_id(id: &str) -> String {
    format!("https://hyp.is/{id}")
}

/// Annotation id embedded in a `hyp.is` share link.
pub fn id_from_share_link(link: &str) -> Option<&str> {
    if !link.contains("hyp.is") {
        return None;
    }
    link.splitn(5, '/').nth(3).filter(|id| !id.is_empty())
}

fn trimmed_tags<'de, D>(deserializer: D) -> std::result::Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let tags = Option::<Vec<String>>::deserialize(deserializer)?;
    Ok(tags
        .unwrap_or_default()
        .into_iter()
        .map(|t| t.trim().to_owned())
        .collect())
}
