use once_cell::sync::Lazy;
use regex::Regex;

use crate::errors::DistributionErrorCode;
use crate::{Error, OciDigest, Result};

const REPOSITORY_MAX_LEN: usize = 255;
const TAG_MAX_LEN: usize = 127;

// A repository path component: lowercase alphanumerics joined by single
// dots, single or double underscores, or runs of dashes.
const COMPONENT: &str = r"[a-z0-9]+(?:(?:\.|_|__|-+)[a-z0-9]+)*";

// A host is a dotted domain, a bare name with an explicit port, or a
// bracketed IPv6 literal; each may carry a port. A bare single-component
// name without a port is a relative repository, never a host.
const HOST: &str = r"(?:[a-zA-Z0-9](?:[a-zA-Z0-9-]*[a-zA-Z0-9])?(?:\.[a-zA-Z0-9](?:[a-zA-Z0-9-]*[a-zA-Z0-9])?)+(?::[0-9]+)?|[a-zA-Z0-9](?:[a-zA-Z0-9-]*[a-zA-Z0-9])?:[0-9]+|\[[0-9a-fA-F:]+\](?::[0-9]+)?)";

const TAG: &str = r"[A-Za-z0-9_][A-Za-z0-9._-]{0,127}";

static REFERENCE_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(&format!(
        r"^(?:({HOST})/)?({COMPONENT}(?:/{COMPONENT})*)(?::({TAG}))?(?:@([a-z0-9]+:[0-9a-zA-Z]+))?$"
    ))
    .expect("reference grammar must compile")
});

static HOST_RE: Lazy<Regex> = Lazy::new(|| Regex::new(&format!("^{HOST}$")).unwrap());
static REPOSITORY_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(&format!("^{COMPONENT}(?:/{COMPONENT})*$")).unwrap());
static TAG_RE: Lazy<Regex> = Lazy::new(|| Regex::new(&format!("^{TAG}$")).unwrap());

pub fn is_valid_repository(s: &str) -> bool {
    s.len() <= REPOSITORY_MAX_LEN && REPOSITORY_RE.is_match(s)
}

pub fn is_valid_tag(s: &str) -> bool {
    s.len() <= TAG_MAX_LEN && TAG_RE.is_match(s)
}

pub fn is_valid_digest(s: &str) -> bool {
    OciDigest::is_valid(s)
}

pub fn is_valid_host(s: &str) -> bool {
    HOST_RE.is_match(s)
}

/// A parsed `[host/]repository[:tag][@digest]` reference.
///
/// [`Reference::parse`] requires the host to be present;
/// [`Reference::parse_relative`] accepts references that name a repository
/// within an implied registry. Formatting via [`std::fmt::Display`] is the
/// exact inverse of parsing.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Reference {
    host: Option<String>,
    repository: String,
    tag: Option<String>,
    digest: Option<OciDigest>,
}

impl Reference {
    pub fn parse(s: &str) -> Result<Self> {
        let r = Self::parse_relative(s)?;
        if r.host.is_none() {
            return Err(Error::InvalidReference(format!(
                "reference has no registry host: {s}"
            )));
        }
        Ok(r)
    }

    pub fn parse_relative(s: &str) -> Result<Self> {
        let caps = REFERENCE_RE
            .captures(s)
            .ok_or_else(|| Error::InvalidReference(s.to_string()))?;

        let repository = caps.get(2).map(|m| m.as_str().to_string()).unwrap_or_default();
        if repository.len() > REPOSITORY_MAX_LEN {
            return Err(Error::InvalidReference(format!(
                "repository name exceeds {REPOSITORY_MAX_LEN} characters: {s}"
            )));
        }
        let tag = caps.get(3).map(|m| m.as_str().to_string());
        if let Some(ref t) = tag {
            if t.len() > TAG_MAX_LEN {
                return Err(Error::InvalidReference(format!(
                    "tag exceeds {TAG_MAX_LEN} characters: {s}"
                )));
            }
        }
        let digest = caps
            .get(4)
            .map(|m| OciDigest::try_from(m.as_str()))
            .transpose()
            .map_err(|_| Error::InvalidReference(s.to_string()))?;

        Ok(Self {
            host: caps.get(1).map(|m| m.as_str().to_string()),
            repository,
            tag,
            digest,
        })
    }

    pub fn host(&self) -> Option<&str> {
        self.host.as_deref()
    }

    pub fn repository(&self) -> &str {
        &self.repository
    }

    pub fn tag(&self) -> Option<&str> {
        self.tag.as_deref()
    }

    pub fn digest(&self) -> Option<&OciDigest> {
        self.digest.as_ref()
    }
}

impl std::fmt::Display for Reference {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        if let Some(host) = &self.host {
            write!(f, "{host}/")?;
        }
        f.write_str(&self.repository)?;
        if let Some(tag) = &self.tag {
            write!(f, ":{tag}")?;
        }
        if let Some(digest) = &self.digest {
            write!(f, "@{digest}")?;
        }
        Ok(())
    }
}

impl std::str::FromStr for Reference {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Reference::parse(s)
    }
}

/// The `<reference>` portion of `/v2/<name>/manifests/<reference>`: either a
/// manifest digest or a tag.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ManifestRef {
    Digest(OciDigest),
    Tag(String),
}

impl std::str::FromStr for ManifestRef {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        if s.contains(':') {
            let dgst = OciDigest::try_from(s)?;
            return Ok(Self::Digest(dgst));
        }
        if is_valid_tag(s) {
            return Ok(Self::Tag(String::from(s)));
        }
        Err(Error::coded_message(
            DistributionErrorCode::ManifestInvalid,
            format!("invalid manifest reference: {s}"),
        ))
    }
}

impl std::fmt::Display for ManifestRef {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            ManifestRef::Digest(d) => d.fmt(f),
            ManifestRef::Tag(t) => f.write_str(t),
        }
    }
}

#[cfg(test)]
mod test {
    use rstest::*;

    use super::*;

    const FHEX: &str = "ffffffffffffffffffffffffffffffffffffffffffffffffffffffffffffffff";

    #[rstest]
    #[case::host_port_digest(
        &format!("test:5000/repo@sha256:{FHEX}"),
        Some("test:5000"), "repo", None, true
    )]
    #[case::dotted_host("registry.example.com/foo/bar:1.2.3", Some("registry.example.com"), "foo/bar", Some("1.2.3"), false)]
    #[case::ipv6_host("[::1]:5000/repo:t", Some("[::1]:5000"), "repo", Some("t"), false)]
    #[case::nested("quay.io/ns/sub/repo", Some("quay.io"), "ns/sub/repo", None, false)]
    fn parse_ok(
        #[case] input: &str,
        #[case] host: Option<&str>,
        #[case] repo: &str,
        #[case] tag: Option<&str>,
        #[case] has_digest: bool,
    ) {
        let r = Reference::parse(input).unwrap();
        assert_eq!(r.host(), host);
        assert_eq!(r.repository(), repo);
        assert_eq!(r.tag(), tag);
        assert_eq!(r.digest().is_some(), has_digest);
    }

    #[rstest]
    #[case::uppercase_repo("Uppercase:tag")]
    #[case::bare_host_is_not_a_host("repo")]
    #[case::bare_host_with_path("host/repo")]
    #[case::empty("")]
    #[case::bad_digest("example.com/repo@sha256:zzzz")]
    #[case::double_slash("example.com//repo")]
    fn parse_rejects(#[case] input: &str) {
        assert!(Reference::parse(input).is_err(), "{input}");
    }

    #[test]
    fn relative_reference_has_no_host() {
        let r = Reference::parse_relative("repo:latest").unwrap();
        assert_eq!(r.host(), None);
        assert_eq!(r.repository(), "repo");
        assert_eq!(r.tag(), Some("latest"));

        // a single path component without a port stays a repository
        let r = Reference::parse_relative("host/repo").unwrap();
        assert_eq!(r.host(), None);
        assert_eq!(r.repository(), "host/repo");
    }

    #[rstest]
    #[case::host_port_digest(&format!("test:5000/repo@sha256:{FHEX}"))]
    #[case::everything(&format!("registry.example.com:443/a/b/c:v1.0@sha256:{FHEX}"))]
    #[case::bare_repo_tag("repo:latest")]
    #[case::plain("some.host/repo")]
    fn format_is_inverse_of_parse(#[case] input: &str) {
        let r = Reference::parse_relative(input).unwrap();
        assert_eq!(r.to_string(), input);
        assert_eq!(Reference::parse_relative(&r.to_string()).unwrap(), r);
    }

    #[rstest]
    #[case::simple("repo", true)]
    #[case::nested("a/b/c", true)]
    #[case::separators("a-b.c_d/e__f", true)]
    #[case::uppercase("Repo", false)]
    #[case::trailing_separator("repo-", false)]
    #[case::leading_separator(".repo", false)]
    fn repository_validator(#[case] input: &str, #[case] ok: bool) {
        assert_eq!(is_valid_repository(input), ok, "{input}");
    }

    #[test]
    fn repository_length_limit() {
        let long = "a/".repeat(127) + "a";
        assert!(long.len() <= 255);
        assert!(is_valid_repository(&long));
        let too_long = "ab/".repeat(85) + "ab";
        assert!(too_long.len() > 255);
        assert!(!is_valid_repository(&too_long));
    }

    #[rstest]
    #[case::simple("latest", true)]
    #[case::leading_underscore("_v1", true)]
    #[case::leading_dot(".v1", false)]
    #[case::leading_dash("-v1", false)]
    #[case::max_len(&"t".repeat(127), true)]
    #[case::too_long(&"t".repeat(128), false)]
    fn tag_validator(#[case] input: &str, #[case] ok: bool) {
        assert_eq!(is_valid_tag(input), ok, "{input}");
    }

    #[rstest]
    #[case::dotted("example.com", true)]
    #[case::dotted_port("example.com:5000", true)]
    #[case::bare_port("test:5000", true)]
    #[case::ipv6("[::1]", true)]
    #[case::ipv6_port("[2001:db8::1]:5000", true)]
    #[case::bare("test", false)]
    #[case::path("example.com/x", false)]
    fn host_validator(#[case] input: &str, #[case] ok: bool) {
        assert_eq!(is_valid_host(input), ok, "{input}");
    }

    #[test]
    fn manifest_ref_from_str() {
        let d = format!("sha256:{FHEX}");
        assert!(matches!(
            d.parse::<ManifestRef>().unwrap(),
            ManifestRef::Digest(_)
        ));
        assert!(matches!(
            "v1.2".parse::<ManifestRef>().unwrap(),
            ManifestRef::Tag(t) if t == "v1.2"
        ));
        assert!("sha256:short".parse::<ManifestRef>().is_err());
        assert!("!bad".parse::<ManifestRef>().is_err());
    }
}
