//! Authorization scope algebra for the token-exchange flow.
//!
//! A scope is a set of `(type, name, action)` triples, serialized as
//! space-separated `type:name:action1,action2` tokens with actions grouped
//! per resource. The canonical form is sorted and deduplicated, so equality,
//! union, and containment are well-defined set operations. A distinct
//! unlimited value contains every scope and absorbs unions.

/// One `(type, name, action)` grant. Tokens that don't have the three-part
/// shape are preserved as a bare `resource_type` with empty name and action.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ResourceScope {
    pub resource_type: String,
    pub resource: String,
    pub action: String,
}

impl ResourceScope {
    pub fn new(
        resource_type: impl Into<String>,
        resource: impl Into<String>,
        action: impl Into<String>,
    ) -> Self {
        Self {
            resource_type: resource_type.into(),
            resource: resource.into(),
            action: action.into(),
        }
    }

    /// `repository:<repo>:pull` / `repository:<repo>:push` style scope.
    pub fn repository(repo: impl Into<String>, action: impl Into<String>) -> Self {
        Self::new("repository", repo, action)
    }
}

#[derive(Clone, Debug)]
pub enum Scope {
    /// Contains every scope; unions to itself.
    Unlimited,
    Scopes {
        // sorted by (type, name, action), deduplicated
        scopes: Vec<ResourceScope>,
        // the exact input string, kept when it is already canonical so
        // servers that demand byte-exact scope echoes get one
        original: Option<String>,
    },
}

impl Scope {
    pub fn empty() -> Self {
        Scope::Scopes {
            scopes: Vec::new(),
            original: None,
        }
    }

    pub fn unlimited() -> Self {
        Scope::Unlimited
    }

    /// Parse a space-separated scope string. Total: tokens that don't parse
    /// as `type:name:actions` triples are kept as single-field scopes.
    pub fn parse(s: &str) -> Self {
        let mut scopes = Vec::new();
        for token in s.split_whitespace() {
            parse_token(token, &mut scopes);
        }
        canonicalize(&mut scopes);
        let canonical = render(&scopes);
        let original = if canonical == s {
            Some(s.to_string())
        } else {
            None
        };
        Scope::Scopes { scopes, original }
    }

    pub fn from_scopes(scopes: impl IntoIterator<Item = ResourceScope>) -> Self {
        let mut scopes: Vec<ResourceScope> = scopes.into_iter().collect();
        canonicalize(&mut scopes);
        Scope::Scopes {
            scopes,
            original: None,
        }
    }

    pub fn is_unlimited(&self) -> bool {
        matches!(self, Scope::Unlimited)
    }

    pub fn is_empty(&self) -> bool {
        match self {
            Scope::Unlimited => false,
            Scope::Scopes { scopes, .. } => scopes.is_empty(),
        }
    }

    /// Number of member scopes. Calling this on an unlimited scope is a
    /// programming error.
    pub fn len(&self) -> usize {
        match self {
            Scope::Unlimited => panic!("Scope::len called on unlimited scope"),
            Scope::Scopes { scopes, .. } => scopes.len(),
        }
    }

    /// Ordered iteration over member scopes. Calling this on an unlimited
    /// scope is a programming error.
    pub fn iter(&self) -> impl Iterator<Item = &ResourceScope> {
        match self {
            Scope::Unlimited => panic!("Scope::iter called on unlimited scope"),
            Scope::Scopes { scopes, .. } => scopes.iter(),
        }
    }

    pub fn union(&self, other: &Scope) -> Scope {
        match (self, other) {
            (Scope::Unlimited, _) | (_, Scope::Unlimited) => Scope::Unlimited,
            (Scope::Scopes { scopes: a, .. }, Scope::Scopes { scopes: b, .. }) => {
                let mut merged = a.clone();
                merged.extend(b.iter().cloned());
                canonicalize(&mut merged);
                Scope::Scopes {
                    scopes: merged,
                    original: None,
                }
            }
        }
    }

    /// Whether `rs` is implied by some member of this scope.
    pub fn holds(&self, rs: &ResourceScope) -> bool {
        match self {
            Scope::Unlimited => true,
            Scope::Scopes { scopes, .. } => scopes.binary_search(rs).is_ok(),
        }
    }

    /// Whether every member of `other` is implied by this scope.
    pub fn contains(&self, other: &Scope) -> bool {
        match (self, other) {
            (Scope::Unlimited, _) => true,
            (_, Scope::Unlimited) => false,
            (_, Scope::Scopes { scopes, .. }) => scopes.iter().all(|rs| self.holds(rs)),
        }
    }
}

impl PartialEq for Scope {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Scope::Unlimited, Scope::Unlimited) => true,
            (Scope::Scopes { scopes: a, .. }, Scope::Scopes { scopes: b, .. }) => a == b,
            _ => false,
        }
    }
}

impl Eq for Scope {}

impl std::fmt::Display for Scope {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            // the unlimited scope has no wire representation; this form is
            // for diagnostics only
            Scope::Unlimited => f.write_str("*"),
            Scope::Scopes { scopes, original } => match original {
                Some(s) => f.write_str(s),
                None => f.write_str(&render(scopes)),
            },
        }
    }
}

impl Default for Scope {
    fn default() -> Self {
        Scope::empty()
    }
}

fn parse_token(token: &str, out: &mut Vec<ResourceScope>) {
    let parts: Vec<&str> = token.splitn(3, ':').collect();
    if parts.len() == 3 && !parts[0].is_empty() && !parts[1].is_empty() {
        let actions: Vec<&str> = parts[2].split(',').filter(|a| !a.is_empty()).collect();
        if !actions.is_empty() {
            for action in actions {
                out.push(ResourceScope::new(parts[0], parts[1], action));
            }
            return;
        }
    }
    // unknown shape: preserve the whole token as a bare resource type
    out.push(ResourceScope {
        resource_type: token.to_string(),
        resource: String::new(),
        action: String::new(),
    });
}

fn canonicalize(scopes: &mut Vec<ResourceScope>) {
    scopes.sort();
    scopes.dedup();
}

fn render(scopes: &[ResourceScope]) -> String {
    let mut out = String::new();
    let mut i = 0;
    while i < scopes.len() {
        if !out.is_empty() {
            out.push(' ');
        }
        let rs = &scopes[i];
        if rs.resource.is_empty() && rs.action.is_empty() {
            out.push_str(&rs.resource_type);
            i += 1;
            continue;
        }
        out.push_str(&rs.resource_type);
        out.push(':');
        out.push_str(&rs.resource);
        out.push(':');
        out.push_str(&rs.action);
        // coalesce actions that share (type, name)
        let mut j = i + 1;
        while j < scopes.len()
            && scopes[j].resource_type == rs.resource_type
            && scopes[j].resource == rs.resource
        {
            out.push(',');
            out.push_str(&scopes[j].action);
            j += 1;
        }
        i = j;
    }
    out
}

#[cfg(test)]
mod test {
    use rstest::*;

    use super::*;

    #[rstest]
    #[case::split_tokens("repository:foo:pull repository:foo:push")]
    #[case::merged("repository:foo:pull,push")]
    #[case::reordered("repository:foo:push,pull")]
    fn action_grouping_is_canonical(#[case] input: &str) {
        let s = Scope::parse(input);
        assert_eq!(s, Scope::parse("repository:foo:pull,push"));
        assert_eq!(s.len(), 2);
    }

    #[test]
    fn canonical_form_is_a_fixed_point() {
        for input in [
            "repository:b:push repository:a:pull",
            "registry:catalog:*",
            "repository:foo:pull,push repository:foo:pull",
            "sometoken",
            "a:b",
        ] {
            let s = Scope::parse(input);
            let canonical = s.to_string();
            let reparsed = Scope::parse(&canonical);
            assert_eq!(reparsed, s, "{input}");
            assert_eq!(reparsed.to_string(), canonical, "{input}");
        }
    }

    #[test]
    fn canonical_input_is_preserved_byte_exact() {
        let input = "repository:foo:pull,push";
        assert_eq!(Scope::parse(input).to_string(), input);

        // non-canonical input renders canonically
        assert_eq!(
            Scope::parse("repository:foo:push,pull").to_string(),
            "repository:foo:pull,push"
        );
    }

    #[test]
    fn unknown_shapes_become_bare_types() {
        let s = Scope::parse("weird a:b x::y");
        let members: Vec<&ResourceScope> = s.iter().collect();
        assert_eq!(members.len(), 3);
        for m in members {
            assert!(m.resource.is_empty());
            assert!(m.action.is_empty());
        }
        assert_eq!(s.to_string(), "a:b weird x::y");
    }

    #[test]
    fn union_laws() {
        let a = Scope::parse("repository:foo:pull");
        let b = Scope::parse("repository:bar:push");
        let c = Scope::parse("registry:catalog:*");

        assert_eq!(a.union(&b), b.union(&a));
        assert_eq!(a.union(&b).union(&c), a.union(&b.union(&c)));
        assert_eq!(a.union(&a), a);
        assert!(a.union(&b).contains(&a));
        assert!(a.union(&b).contains(&b));
    }

    #[test]
    fn contains_and_holds() {
        let s = Scope::parse("repository:foo:pull,push repository:bar:pull");
        assert!(s.holds(&ResourceScope::repository("foo", "push")));
        assert!(!s.holds(&ResourceScope::repository("foo", "delete")));
        assert!(s.contains(&Scope::parse("repository:bar:pull repository:foo:pull")));
        assert!(!s.contains(&Scope::parse("repository:baz:pull")));
        assert!(s.contains(&Scope::empty()));
        assert!(!Scope::empty().contains(&s));
    }

    #[test]
    fn unlimited_semantics() {
        let s = Scope::parse("repository:foo:pull");
        let unlimited = Scope::unlimited();

        assert!(unlimited.contains(&s));
        assert!(unlimited.contains(&unlimited));
        assert!(!s.contains(&unlimited));
        assert!(unlimited.union(&s).is_unlimited());
        assert!(s.union(&unlimited).is_unlimited());
        assert!(unlimited.holds(&ResourceScope::repository("any", "pull")));
    }

    #[test]
    #[should_panic]
    fn len_on_unlimited_panics() {
        let _ = Scope::unlimited().len();
    }

    #[test]
    fn empty_scope() {
        let e = Scope::empty();
        assert!(e.is_empty());
        assert_eq!(e.len(), 0);
        assert_eq!(e.to_string(), "");
        assert_eq!(Scope::parse(""), e);
    }
}
