use std::collections::VecDeque;
use std::sync::Arc;

use futures::stream;
use reqwest::StatusCode;

use wharf_core::registry::EntryStream;
use wharf_core::wire;
use wharf_core::{Descriptor, DistributionErrorCode, Index, OciDigest, RepositoryList, TagList};

use crate::{catalog_scope, error_from_response, pull_scope, transport, ClientInner, RemoteRegistry};

// page size requested from the registry; servers may clamp it
const PAGE_SIZE: usize = 100;

struct PageState<T> {
    inner: Arc<ClientInner>,
    last: Option<String>,
    buffer: VecDeque<T>,
    done: bool,
}

impl RemoteRegistry {
    pub(crate) fn repositories_impl(&self, start_after: Option<String>) -> EntryStream<String> {
        let state: PageState<String> = PageState {
            inner: self.inner.clone(),
            last: start_after,
            buffer: VecDeque::new(),
            done: false,
        };
        Box::pin(stream::try_unfold(state, |mut st| async move {
            loop {
                if let Some(repo) = st.buffer.pop_front() {
                    st.last = Some(repo.clone());
                    return Ok(Some((repo, st)));
                }
                if st.done {
                    return Ok(None);
                }
                let req = wire::Request::CatalogList {
                    n: Some(PAGE_SIZE),
                    last: st.last.clone(),
                };
                let resp = st.inner.send(&req, &catalog_scope(), None, &[]).await?;
                if resp.status() != StatusCode::OK {
                    return Err(
                        error_from_response(resp, DistributionErrorCode::Unsupported).await
                    );
                }
                let list: RepositoryList = resp.json().await.map_err(transport)?;
                if list.repositories.len() < PAGE_SIZE {
                    st.done = true;
                }
                st.buffer.extend(list.repositories);
            }
        }))
    }

    pub(crate) fn tags_impl(&self, repo: &str, start_after: Option<String>) -> EntryStream<String> {
        let repo = repo.to_string();
        let state: PageState<String> = PageState {
            inner: self.inner.clone(),
            last: start_after,
            buffer: VecDeque::new(),
            done: false,
        };
        Box::pin(stream::try_unfold(state, move |mut st| {
            let repo = repo.clone();
            async move {
                loop {
                    if let Some(tag) = st.buffer.pop_front() {
                        st.last = Some(tag.clone());
                        return Ok(Some((tag, st)));
                    }
                    if st.done {
                        return Ok(None);
                    }
                    let req = wire::Request::TagsList {
                        repo: repo.clone(),
                        n: Some(PAGE_SIZE),
                        last: st.last.clone(),
                    };
                    let resp = st.inner.send(&req, &pull_scope(&repo), None, &[]).await?;
                    if resp.status() != StatusCode::OK {
                        return Err(
                            error_from_response(resp, DistributionErrorCode::NameUnknown).await
                        );
                    }
                    let list: TagList = resp.json().await.map_err(transport)?;
                    if list.tags.len() < PAGE_SIZE {
                        st.done = true;
                    }
                    st.buffer.extend(list.tags);
                }
            }
        }))
    }

    pub(crate) fn referrers_impl(
        &self,
        repo: &str,
        digest: &OciDigest,
        artifact_type: Option<String>,
    ) -> EntryStream<Descriptor> {
        let repo = repo.to_string();
        let digest = digest.clone();
        let state = PageState {
            inner: self.inner.clone(),
            last: None,
            buffer: VecDeque::new(),
            done: false,
        };
        Box::pin(stream::try_unfold(state, move |mut st| {
            let repo = repo.clone();
            let digest = digest.clone();
            let artifact_type = artifact_type.clone();
            async move {
                loop {
                    if let Some(descriptor) = st.buffer.pop_front() {
                        return Ok(Some((descriptor, st)));
                    }
                    if st.done {
                        return Ok(None);
                    }
                    st.done = true;
                    let req = wire::Request::ReferrersList {
                        repo: repo.clone(),
                        digest: digest.clone(),
                        artifact_type: artifact_type.clone(),
                    };
                    let resp = st.inner.send(&req, &pull_scope(&repo), None, &[]).await?;
                    if resp.status() != StatusCode::OK {
                        return Err(
                            error_from_response(resp, DistributionErrorCode::ManifestUnknown)
                                .await,
                        );
                    }
                    let index: Index = resp.json().await.map_err(transport)?;
                    // filter locally too; servers predating the artifactType
                    // parameter return everything
                    st.buffer.extend(index.manifests.into_iter().filter(|d| {
                        match &artifact_type {
                            Some(at) => d.artifact_type.as_deref() == Some(at.as_str()),
                            None => true,
                        }
                    }));
                }
            }
        }))
    }
}
