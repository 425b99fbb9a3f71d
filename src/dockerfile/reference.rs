//! Image reference parsing.
//!
//! Splits references like `ghcr.io/org/app:v1@sha256:abc` into their parts and
//! derives a normalized key used to deduplicate references that name the same
//! image in different spellings (`alpine` vs `docker.io/library/alpine:latest`).

use std::fmt;

use serde::{Serialize, Serializer};
use thiserror::Error;

/// Registry assumed when the reference does not name one.
const DEFAULT_REGISTRY: &str = "docker.io";

/// Tag assumed when the reference has neither a tag nor a digest.
const DEFAULT_TAG: &str = "latest";

#[derive(Error, Debug, PartialEq, Eq)]
#[error("invalid image reference '{reference}': {reason}")]
pub struct InvalidReference {
    pub reference: String,
    pub reason: &'static str,
}

/// A parsed image reference. `raw` is kept verbatim for output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageReference {
    /// Registry host (`docker.io` when not written)
    pub registry: String,
    /// Repository as written, including any registry prefix
    pub repository: String,
    pub tag: Option<String>,
    pub digest: Option<String>,
    pub raw: String,
}

impl ImageReference {
    pub fn parse(raw: &str) -> Result<Self, InvalidReference> {
        let invalid = |reason| InvalidReference {
            reference: raw.to_string(),
            reason,
        };

        let reference = raw.trim();
        if reference.is_empty() {
            return Err(invalid("reference is empty"));
        }
        if reference.chars().any(char::is_whitespace) {
            return Err(invalid("reference contains whitespace"));
        }

        let (name_tag, digest) = match reference.rsplit_once('@') {
            Some((name_tag, digest)) => {
                if !digest.contains(':') || digest.starts_with(':') || digest.ends_with(':') {
                    return Err(invalid("digest must be algorithm:hex"));
                }
                (name_tag, Some(digest.to_string()))
            }
            None => (reference, None),
        };

        // The tag separator is the last ':' after the last '/', so that a
        // registry port (`registry:5000/app`) is not mistaken for a tag.
        let last_slash = name_tag.rfind('/').map(|i| i + 1).unwrap_or(0);
        let (repository, tag) = match name_tag[last_slash..].rfind(':') {
            Some(colon) => {
                let colon = last_slash + colon;
                (&name_tag[..colon], Some(name_tag[colon + 1..].to_string()))
            }
            None => (name_tag, None),
        };

        if repository.is_empty() || repository.ends_with('/') || repository.starts_with('/') {
            return Err(invalid("repository is empty"));
        }
        if tag.as_deref() == Some("") {
            return Err(invalid("tag is empty"));
        }

        Ok(ImageReference {
            registry: registry_of(repository).to_string(),
            repository: repository.to_string(),
            tag,
            digest,
            raw: reference.to_string(),
        })
    }

    /// Checks the reference against the registry naming rules: a host name
    /// with optional port, lowercase path components, a `[\w][\w.-]{0,127}`
    /// tag and an `algorithm:encoded` digest.
    ///
    /// Stage names are not image names, so this only applies to references
    /// that resolve to a registry image.
    pub fn check_grammar(&self) -> Result<(), InvalidReference> {
        let invalid = |reason| InvalidReference {
            reference: self.raw.clone(),
            reason,
        };

        let path = match self.repository.split_once('/') {
            Some((first, rest)) if first == self.registry => {
                if !is_valid_host(first) {
                    return Err(invalid("invalid registry host"));
                }
                rest
            }
            _ => self.repository.as_str(),
        };
        if !path.split('/').all(is_valid_path_component) {
            return Err(invalid("repository must be lowercase letters, digits and separators"));
        }

        if let Some(tag) = &self.tag
            && !is_valid_tag(tag)
        {
            return Err(invalid("invalid tag"));
        }

        if let Some(digest) = &self.digest
            && !is_valid_digest(digest)
        {
            return Err(invalid("invalid digest"));
        }

        Ok(())
    }

    /// True for `scratch`, the reserved empty base image.
    pub fn is_scratch(&self) -> bool {
        self.tag.is_none() && self.digest.is_none() && self.repository.eq_ignore_ascii_case("scratch")
    }

    /// True when the reference carries neither a tag nor a digest, i.e. it
    /// could name a build stage.
    pub fn is_bare(&self) -> bool {
        self.tag.is_none() && self.digest.is_none()
    }

    /// Canonical `registry/path[:tag][@digest]` form used as a dedup key.
    pub fn normalized(&self) -> String {
        let path = match self.repository.strip_prefix(&self.registry) {
            Some(rest) if rest.starts_with('/') => &rest[1..],
            _ => self.repository.as_str(),
        };

        let mut key = if self.registry == DEFAULT_REGISTRY && !path.contains('/') {
            format!("{}/library/{}", self.registry, path)
        } else {
            format!("{}/{}", self.registry, path)
        };

        match (&self.tag, &self.digest) {
            (Some(tag), _) => {
                key.push(':');
                key.push_str(tag);
            }
            (None, None) => {
                key.push(':');
                key.push_str(DEFAULT_TAG);
            }
            (None, Some(_)) => {}
        }
        if let Some(digest) = &self.digest {
            key.push('@');
            key.push_str(digest);
        }
        key
    }
}

/// The first path component is a registry if it looks like a host name.
fn registry_of(repository: &str) -> &str {
    match repository.split_once('/') {
        Some((first, _)) if first.contains('.') || first.contains(':') || first == "localhost" => first,
        _ => DEFAULT_REGISTRY,
    }
}

fn is_valid_host(host: &str) -> bool {
    let (name, port) = match host.rsplit_once(':') {
        Some((name, port)) => (name, Some(port)),
        None => (host, None),
    };
    let name_ok = !name.is_empty()
        && name.split('.').all(|label| {
            !label.is_empty()
                && !label.starts_with('-')
                && !label.ends_with('-')
                && label.chars().all(|c| c.is_ascii_alphanumeric() || c == '-')
        });
    let port_ok = port.is_none_or(|p| !p.is_empty() && p.chars().all(|c| c.is_ascii_digit()));
    name_ok && port_ok
}

/// `[a-z0-9]+((\.|_|__|-+)[a-z0-9]+)*`
fn is_valid_path_component(component: &str) -> bool {
    let bytes = component.as_bytes();
    let alnum = |b: u8| b.is_ascii_lowercase() || b.is_ascii_digit();
    if bytes.is_empty() || !alnum(bytes[0]) || !alnum(bytes[bytes.len() - 1]) {
        return false;
    }

    let mut i = 0;
    while i < bytes.len() {
        if alnum(bytes[i]) {
            i += 1;
            continue;
        }
        let start = i;
        while i < bytes.len() && !alnum(bytes[i]) {
            i += 1;
        }
        let separator = &component[start..i];
        let ok = matches!(separator, "." | "_" | "__") || separator.bytes().all(|b| b == b'-');
        if !ok {
            return false;
        }
    }
    true
}

fn is_valid_tag(tag: &str) -> bool {
    let word = |c: char| c.is_ascii_alphanumeric() || c == '_';
    let mut chars = tag.chars();
    tag.len() <= 128
        && chars.next().is_some_and(word)
        && chars.all(|c| word(c) || c == '.' || c == '-')
}

fn is_valid_digest(digest: &str) -> bool {
    let Some((algorithm, encoded)) = digest.split_once(':') else {
        return false;
    };
    let algorithm_ok = algorithm
        .split(['+', '.', '_', '-'])
        .all(|part| !part.is_empty() && part.bytes().all(|b| b.is_ascii_lowercase() || b.is_ascii_digit()));
    let encoded_ok = !encoded.is_empty()
        && encoded
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '=' | '_' | '-'));
    algorithm_ok && encoded_ok
}

impl fmt::Display for ImageReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

impl Serialize for ImageReference {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.raw)
    }
}
