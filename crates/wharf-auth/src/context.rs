//! Ambient authorization scope.
//!
//! Callers that know they will touch several resources can run a future
//! with a wider ambient scope so that one token grant covers all of them.
//! The authenticator unions the ambient scope into every token request made
//! below the wrapped future; adapters such as the sub-prefix view rewrite it
//! before delegating.

use std::future::Future;

use crate::scope::Scope;

tokio::task_local! {
    static AMBIENT_SCOPE: Scope;
}

/// Run `fut` with `scope` as the ambient authorization scope.
pub async fn with_ambient_scope<F: Future>(scope: Scope, fut: F) -> F::Output {
    AMBIENT_SCOPE.scope(scope, fut).await
}

/// Run `f` synchronously with `scope` as the ambient authorization scope.
/// This is the poll-time variant used by stream adapters that cannot wrap a
/// whole future.
pub fn with_ambient_scope_sync<R>(scope: Scope, f: impl FnOnce() -> R) -> R {
    AMBIENT_SCOPE.sync_scope(scope, f)
}

/// The ambient scope of the current task, empty when none was set.
pub fn ambient_scope() -> Scope {
    AMBIENT_SCOPE
        .try_with(|s| s.clone())
        .unwrap_or_else(|_| Scope::empty())
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::scope::ResourceScope;

    #[tokio::test]
    async fn ambient_scope_is_task_scoped() {
        assert!(ambient_scope().is_empty());

        let scope = Scope::from_scopes([ResourceScope::repository("foo", "pull")]);
        with_ambient_scope(scope.clone(), async {
            assert_eq!(ambient_scope(), scope);
            // nesting replaces, not unions
            let inner = Scope::from_scopes([ResourceScope::repository("bar", "push")]);
            with_ambient_scope(inner.clone(), async move {
                assert_eq!(ambient_scope(), inner);
            })
            .await;
        })
        .await;

        assert!(ambient_scope().is_empty());
    }
}
