//! Typed decomposition of the OCI distribution API surface.
//!
//! Every endpoint of the protocol is represented by one [`Request`] variant.
//! [`Request::method`] and [`Request::target`] construct the canonical
//! method and URL; [`Request::parse`] is the exact inverse and is what the
//! HTTP server dispatches on.

use http::Method;

use crate::errors::DistributionErrorCode;
use crate::reference::{is_valid_repository, ManifestRef};
use crate::{Error, OciDigest, Result};

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Request {
    /// `GET /v2/`
    Ping,

    /// `GET /v2/<repo>/blobs/<digest>`
    BlobGet { repo: String, digest: OciDigest },
    /// `HEAD /v2/<repo>/blobs/<digest>`
    BlobHead { repo: String, digest: OciDigest },
    /// `DELETE /v2/<repo>/blobs/<digest>`
    BlobDelete { repo: String, digest: OciDigest },

    /// `POST /v2/<repo>/blobs/uploads/`
    UploadStart { repo: String },
    /// `POST /v2/<repo>/blobs/uploads/?digest=<digest>`
    UploadMonolithic { repo: String, digest: OciDigest },
    /// `POST /v2/<repo>/blobs/uploads/?mount=<digest>&from=<repo>`
    UploadMount {
        repo: String,
        from_repo: String,
        digest: OciDigest,
    },
    /// `GET /v2/<repo>/blobs/uploads/<id>`
    UploadInfo { repo: String, id: String },
    /// `PATCH /v2/<repo>/blobs/uploads/<id>`
    UploadChunk { repo: String, id: String },
    /// `PUT /v2/<repo>/blobs/uploads/<id>?digest=<digest>`
    UploadComplete {
        repo: String,
        id: String,
        digest: OciDigest,
    },

    /// `GET /v2/<repo>/manifests/<ref>`
    ManifestGet { repo: String, reference: ManifestRef },
    /// `HEAD /v2/<repo>/manifests/<ref>`
    ManifestHead { repo: String, reference: ManifestRef },
    /// `PUT /v2/<repo>/manifests/<ref>`
    ManifestPut { repo: String, reference: ManifestRef },
    /// `DELETE /v2/<repo>/manifests/<ref>`
    ManifestDelete { repo: String, reference: ManifestRef },

    /// `GET /v2/<repo>/tags/list?n=<n>&last=<last>`
    TagsList {
        repo: String,
        n: Option<usize>,
        last: Option<String>,
    },
    /// `GET /v2/<repo>/referrers/<digest>?artifactType=<type>`
    ReferrersList {
        repo: String,
        digest: OciDigest,
        artifact_type: Option<String>,
    },
    /// `GET /v2/_catalog?n=<n>&last=<last>` (out of spec, widely deployed)
    CatalogList {
        n: Option<usize>,
        last: Option<String>,
    },
}

impl Request {
    pub fn method(&self) -> Method {
        match self {
            Request::Ping
            | Request::BlobGet { .. }
            | Request::UploadInfo { .. }
            | Request::ManifestGet { .. }
            | Request::TagsList { .. }
            | Request::ReferrersList { .. }
            | Request::CatalogList { .. } => Method::GET,
            Request::BlobHead { .. } | Request::ManifestHead { .. } => Method::HEAD,
            Request::BlobDelete { .. } | Request::ManifestDelete { .. } => Method::DELETE,
            Request::UploadStart { .. }
            | Request::UploadMonolithic { .. }
            | Request::UploadMount { .. } => Method::POST,
            Request::UploadChunk { .. } => Method::PATCH,
            Request::UploadComplete { .. } | Request::ManifestPut { .. } => Method::PUT,
        }
    }

    /// The canonical path-and-query for this request.
    pub fn target(&self) -> String {
        match self {
            Request::Ping => "/v2/".to_string(),
            Request::BlobGet { repo, digest }
            | Request::BlobHead { repo, digest }
            | Request::BlobDelete { repo, digest } => format!("/v2/{repo}/blobs/{digest}"),
            Request::UploadStart { repo } => format!("/v2/{repo}/blobs/uploads/"),
            Request::UploadMonolithic { repo, digest } => {
                format!("/v2/{repo}/blobs/uploads/?digest={digest}")
            }
            Request::UploadMount {
                repo,
                from_repo,
                digest,
            } => format!("/v2/{repo}/blobs/uploads/?mount={digest}&from={from_repo}"),
            Request::UploadInfo { repo, id } | Request::UploadChunk { repo, id } => {
                format!("/v2/{repo}/blobs/uploads/{id}")
            }
            Request::UploadComplete { repo, id, digest } => {
                format!("/v2/{repo}/blobs/uploads/{id}?digest={digest}")
            }
            Request::ManifestGet { repo, reference }
            | Request::ManifestHead { repo, reference }
            | Request::ManifestPut { repo, reference }
            | Request::ManifestDelete { repo, reference } => {
                format!("/v2/{repo}/manifests/{reference}")
            }
            Request::TagsList { repo, n, last } => {
                format!("/v2/{repo}/tags/list{}", list_query(*n, last.as_deref()))
            }
            Request::ReferrersList {
                repo,
                digest,
                artifact_type,
            } => match artifact_type {
                Some(at) => format!("/v2/{repo}/referrers/{digest}?artifactType={at}"),
                None => format!("/v2/{repo}/referrers/{digest}"),
            },
            Request::CatalogList { n, last } => {
                format!("/v2/_catalog{}", list_query(*n, last.as_deref()))
            }
        }
    }

    /// Parse a method and path-and-query back into a [`Request`].
    ///
    /// Unknown paths yield a not-found error; known paths with the wrong
    /// method yield [`Error::MethodNotAllowed`]. Repository, tag, and digest
    /// segments are validated syntactically.
    pub fn parse(method: &Method, path_and_query: &str) -> Result<Request> {
        let (path, query) = match path_and_query.split_once('?') {
            Some((p, q)) => (p, q),
            None => (path_and_query, ""),
        };
        let params = parse_query(query);

        let rest = if path == "/v2" || path == "/v2/" {
            ""
        } else {
            path.strip_prefix("/v2/").ok_or_else(|| not_found(path))?
        };

        if rest.is_empty() {
            return if method == Method::GET {
                Ok(Request::Ping)
            } else {
                Err(Error::MethodNotAllowed)
            };
        }

        if rest == "_catalog" {
            if method != Method::GET {
                return Err(Error::MethodNotAllowed);
            }
            let (n, last) = list_params(&params);
            return Ok(Request::CatalogList { n, last });
        }

        let segs: Vec<&str> = rest.split('/').collect();
        let n_segs = segs.len();

        // `/v2/<repo>/tags/list`
        if n_segs >= 3 && segs[n_segs - 2] == "tags" && segs[n_segs - 1] == "list" {
            let repo = parse_repo(&segs[..n_segs - 2])?;
            if method != Method::GET {
                return Err(Error::MethodNotAllowed);
            }
            let (n, last) = list_params(&params);
            return Ok(Request::TagsList { repo, n, last });
        }

        // `/v2/<repo>/manifests/<ref>`
        if n_segs >= 3 && segs[n_segs - 2] == "manifests" {
            let repo = parse_repo(&segs[..n_segs - 2])?;
            let reference: ManifestRef = segs[n_segs - 1].parse()?;
            return match *method {
                Method::GET => Ok(Request::ManifestGet { repo, reference }),
                Method::HEAD => Ok(Request::ManifestHead { repo, reference }),
                Method::PUT => Ok(Request::ManifestPut { repo, reference }),
                Method::DELETE => Ok(Request::ManifestDelete { repo, reference }),
                _ => Err(Error::MethodNotAllowed),
            };
        }

        // `/v2/<repo>/referrers/<digest>`
        if n_segs >= 3 && segs[n_segs - 2] == "referrers" {
            let repo = parse_repo(&segs[..n_segs - 2])?;
            let digest = OciDigest::try_from(segs[n_segs - 1])?;
            if method != Method::GET {
                return Err(Error::MethodNotAllowed);
            }
            let artifact_type = param(&params, "artifactType");
            return Ok(Request::ReferrersList {
                repo,
                digest,
                artifact_type,
            });
        }

        // `/v2/<repo>/blobs/uploads/` and `/v2/<repo>/blobs/uploads` — the
        // upload start family
        if (n_segs >= 4
            && segs[n_segs - 1].is_empty()
            && segs[n_segs - 2] == "uploads"
            && segs[n_segs - 3] == "blobs")
            || (n_segs >= 3 && segs[n_segs - 1] == "uploads" && segs[n_segs - 2] == "blobs")
        {
            let tail = if segs[n_segs - 1].is_empty() { 3 } else { 2 };
            let repo = parse_repo(&segs[..n_segs - tail])?;
            if method != Method::POST {
                return Err(Error::MethodNotAllowed);
            }
            if let Some(digest) = param(&params, "digest") {
                let digest = OciDigest::try_from(digest.as_str())?;
                return Ok(Request::UploadMonolithic { repo, digest });
            }
            if let Some(mount) = param(&params, "mount") {
                // an empty `from` degrades to a plain upload start
                match param(&params, "from") {
                    Some(from_repo) if !from_repo.is_empty() => {
                        let digest = OciDigest::try_from(mount.as_str())?;
                        return Ok(Request::UploadMount {
                            repo,
                            from_repo,
                            digest,
                        });
                    }
                    _ => return Ok(Request::UploadStart { repo }),
                }
            }
            return Ok(Request::UploadStart { repo });
        }

        // `/v2/<repo>/blobs/uploads/<id>`
        if n_segs >= 4 && segs[n_segs - 2] == "uploads" && segs[n_segs - 3] == "blobs" {
            let repo = parse_repo(&segs[..n_segs - 3])?;
            let id = segs[n_segs - 1].to_string();
            return match *method {
                Method::GET => Ok(Request::UploadInfo { repo, id }),
                Method::PATCH => Ok(Request::UploadChunk { repo, id }),
                Method::PUT => {
                    let digest = param(&params, "digest").ok_or_else(|| {
                        Error::coded_message(
                            DistributionErrorCode::DigestInvalid,
                            "upload completion requires a digest query parameter",
                        )
                    })?;
                    let digest = OciDigest::try_from(digest.as_str())?;
                    Ok(Request::UploadComplete { repo, id, digest })
                }
                _ => Err(Error::MethodNotAllowed),
            };
        }

        // `/v2/<repo>/blobs/<digest>`
        if n_segs >= 3 && segs[n_segs - 2] == "blobs" {
            let repo = parse_repo(&segs[..n_segs - 2])?;
            let digest = OciDigest::try_from(segs[n_segs - 1])?;
            return match *method {
                Method::GET => Ok(Request::BlobGet { repo, digest }),
                Method::HEAD => Ok(Request::BlobHead { repo, digest }),
                Method::DELETE => Ok(Request::BlobDelete { repo, digest }),
                _ => Err(Error::MethodNotAllowed),
            };
        }

        Err(not_found(path))
    }
}

fn not_found(path: &str) -> Error {
    Error::coded_message(
        DistributionErrorCode::NameUnknown,
        format!("no such API endpoint: {path}"),
    )
}

fn parse_repo(segs: &[&str]) -> Result<String> {
    let repo = segs.join("/");
    if !is_valid_repository(&repo) {
        return Err(Error::coded_message(
            DistributionErrorCode::NameInvalid,
            format!("invalid repository name: {repo:?}"),
        ));
    }
    Ok(repo)
}

fn list_query(n: Option<usize>, last: Option<&str>) -> String {
    let mut query = String::new();
    if let Some(n) = n {
        query.push_str(&format!("n={n}"));
    }
    if let Some(last) = last {
        if !query.is_empty() {
            query.push('&');
        }
        query.push_str(&format!("last={last}"));
    }
    if query.is_empty() {
        query
    } else {
        format!("?{query}")
    }
}

fn list_params(params: &[(String, String)]) -> (Option<usize>, Option<String>) {
    let n = param(params, "n").and_then(|v| v.parse().ok());
    let last = param(params, "last").filter(|v| !v.is_empty());
    (n, last)
}

fn param(params: &[(String, String)], name: &str) -> Option<String> {
    params
        .iter()
        .find(|(k, _)| k == name)
        .map(|(_, v)| v.clone())
}

fn parse_query(query: &str) -> Vec<(String, String)> {
    query
        .split('&')
        .filter(|kv| !kv.is_empty())
        .map(|kv| match kv.split_once('=') {
            Some((k, v)) => (percent_decode(k), percent_decode(v)),
            None => (percent_decode(kv), String::new()),
        })
        .collect()
}

fn percent_decode(s: &str) -> String {
    let bytes = s.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' && i + 2 < bytes.len() {
            let decoded = std::str::from_utf8(&bytes[i + 1..i + 3])
                .ok()
                .and_then(|hex| u8::from_str_radix(hex, 16).ok());
            if let Some(b) = decoded {
                out.push(b);
                i += 3;
                continue;
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}

#[cfg(test)]
mod test {
    use super::*;

    fn fdigest() -> OciDigest {
        OciDigest::try_from(
            format!(
                "sha256:{}",
                "ffffffffffffffffffffffffffffffffffffffffffffffffffffffffffffffff"
            )
            .as_str(),
        )
        .unwrap()
    }

    fn all_requests() -> Vec<Request> {
        let repo = "some/nested/repo".to_string();
        vec![
            Request::Ping,
            Request::BlobGet {
                repo: repo.clone(),
                digest: fdigest(),
            },
            Request::BlobHead {
                repo: repo.clone(),
                digest: fdigest(),
            },
            Request::BlobDelete {
                repo: repo.clone(),
                digest: fdigest(),
            },
            Request::UploadStart { repo: repo.clone() },
            Request::UploadMonolithic {
                repo: repo.clone(),
                digest: fdigest(),
            },
            Request::UploadMount {
                repo: repo.clone(),
                from_repo: "other/repo".to_string(),
                digest: fdigest(),
            },
            Request::UploadInfo {
                repo: repo.clone(),
                id: "c2Vzc2lvbi1pZA".to_string(),
            },
            Request::UploadChunk {
                repo: repo.clone(),
                id: "c2Vzc2lvbi1pZA".to_string(),
            },
            Request::UploadComplete {
                repo: repo.clone(),
                id: "c2Vzc2lvbi1pZA".to_string(),
                digest: fdigest(),
            },
            Request::ManifestGet {
                repo: repo.clone(),
                reference: ManifestRef::Tag("v1".to_string()),
            },
            Request::ManifestHead {
                repo: repo.clone(),
                reference: ManifestRef::Digest(fdigest()),
            },
            Request::ManifestPut {
                repo: repo.clone(),
                reference: ManifestRef::Tag("latest".to_string()),
            },
            Request::ManifestDelete {
                repo: repo.clone(),
                reference: ManifestRef::Digest(fdigest()),
            },
            Request::TagsList {
                repo: repo.clone(),
                n: Some(50),
                last: Some("v0".to_string()),
            },
            Request::TagsList {
                repo: repo.clone(),
                n: None,
                last: None,
            },
            Request::ReferrersList {
                repo: repo.clone(),
                digest: fdigest(),
                artifact_type: Some("application/spdx".to_string()),
            },
            Request::ReferrersList {
                repo,
                digest: fdigest(),
                artifact_type: None,
            },
            Request::CatalogList {
                n: Some(10),
                last: Some("zed".to_string()),
            },
        ]
    }

    #[test]
    fn construct_parse_round_trip() {
        for req in all_requests() {
            let method = req.method();
            let target = req.target();
            let parsed = Request::parse(&method, &target)
                .unwrap_or_else(|e| panic!("{method} {target}: {e}"));
            assert_eq!(parsed, req, "{method} {target}");
        }
    }

    #[test]
    fn mount_with_empty_from_degrades_to_start() {
        let target = format!("/v2/repo/blobs/uploads/?mount={}&from=", fdigest());
        let parsed = Request::parse(&Method::POST, &target).unwrap();
        assert_eq!(
            parsed,
            Request::UploadStart {
                repo: "repo".to_string()
            }
        );

        let target = format!("/v2/repo/blobs/uploads/?mount={}", fdigest());
        let parsed = Request::parse(&Method::POST, &target).unwrap();
        assert_eq!(
            parsed,
            Request::UploadStart {
                repo: "repo".to_string()
            }
        );
    }

    #[test]
    fn post_without_digest_or_mount_is_start() {
        let parsed = Request::parse(&Method::POST, "/v2/a/b/blobs/uploads/").unwrap();
        assert_eq!(
            parsed,
            Request::UploadStart {
                repo: "a/b".to_string()
            }
        );
        // trailing slash is optional
        let parsed = Request::parse(&Method::POST, "/v2/a/b/blobs/uploads").unwrap();
        assert_eq!(
            parsed,
            Request::UploadStart {
                repo: "a/b".to_string()
            }
        );
    }

    #[test]
    fn unknown_paths_and_methods() {
        let err = Request::parse(&Method::GET, "/v1/whatever").unwrap_err();
        assert!(err.is_code(DistributionErrorCode::NameUnknown));

        let err = Request::parse(&Method::GET, "/v2/repo/unknown/leaf").unwrap_err();
        assert!(err.is_code(DistributionErrorCode::NameUnknown));

        let err = Request::parse(&Method::POST, "/v2/repo/blobs/".to_string().as_str());
        assert!(err.is_err());

        let err =
            Request::parse(&Method::PATCH, &format!("/v2/repo/blobs/{}", fdigest())).unwrap_err();
        assert!(matches!(err, Error::MethodNotAllowed));

        let err = Request::parse(&Method::POST, "/v2/").unwrap_err();
        assert!(matches!(err, Error::MethodNotAllowed));
    }

    #[test]
    fn validation_errors_carry_codes() {
        let err = Request::parse(&Method::GET, "/v2/UPPER/blobs/sha256:ffff").unwrap_err();
        assert!(err.is_code(DistributionErrorCode::NameInvalid));

        let err =
            Request::parse(&Method::GET, "/v2/repo/blobs/sha256:nothex").unwrap_err();
        assert!(err.is_code(DistributionErrorCode::DigestInvalid));

        let err = Request::parse(
            &Method::PUT,
            "/v2/repo/blobs/uploads/c2Vzc2lvbg",
        )
        .unwrap_err();
        assert!(err.is_code(DistributionErrorCode::DigestInvalid));
    }

    #[test]
    fn ping_accepts_both_spellings() {
        assert_eq!(Request::parse(&Method::GET, "/v2/").unwrap(), Request::Ping);
        assert_eq!(Request::parse(&Method::GET, "/v2").unwrap(), Request::Ping);
    }

    #[test]
    fn query_decoding() {
        let target = "/v2/repo/tags/list?n=5&last=a%2Fb";
        match Request::parse(&Method::GET, target).unwrap() {
            Request::TagsList { n, last, .. } => {
                assert_eq!(n, Some(5));
                assert_eq!(last.as_deref(), Some("a/b"));
            }
            other => panic!("unexpected {other:?}"),
        }
    }
}
