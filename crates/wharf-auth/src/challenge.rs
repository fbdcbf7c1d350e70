//! `Www-Authenticate` challenge parsing.

/// A parsed authentication challenge from a 401 response.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Challenge {
    /// Lowercased auth scheme, e.g. `bearer` or `basic`.
    pub scheme: String,
    pub realm: Option<String>,
    pub service: Option<String>,
    pub scope: Option<String>,
}

impl Challenge {
    pub fn is_bearer(&self) -> bool {
        self.scheme == "bearer"
    }
}

/// Parse a `Www-Authenticate` header value of the shape
/// `Scheme key="value", key="value", ...`. Unknown parameters are ignored;
/// a bare scheme with no parameters parses too.
pub fn parse_challenge(input: &str) -> Option<Challenge> {
    use nom::{
        IResult, Parser,
        bytes::{complete::tag, take_until1},
        character::complete::{alpha1, char},
        multi::{many0, separated_list0},
        sequence::{delimited, separated_pair, terminated},
    };
    fn parser(input: &str) -> IResult<&str, (&str, Vec<(&str, &str)>)> {
        let (input, scheme) = alpha1.parse(input)?;
        let (input, _) = many0(tag(" ")).parse(input)?;
        let (input, matches) = separated_list0(
            terminated(tag(","), many0(tag(" "))),
            separated_pair(
                alpha1,
                tag("="),
                delimited(char('"'), take_until1("\""), char('"')),
            ),
        )
        .parse(input)?;
        Ok((input, (scheme, matches)))
    }
    // a scheme followed by parameters must have whitespace between them;
    // without this check `Bearerrealm=...` would parse as a bare scheme
    let (scheme_part, _) = input.split_once(' ').unwrap_or((input, ""));
    if scheme_part.chars().any(|c| !c.is_ascii_alphabetic()) {
        return None;
    }
    let (_, (scheme, matches)) = parser(input).ok()?;
    let mut ret = Challenge {
        scheme: scheme.to_ascii_lowercase(),
        realm: None,
        service: None,
        scope: None,
    };
    for (k, v) in matches.into_iter() {
        match k {
            "realm" => ret.realm = Some(v.to_string()),
            "service" => ret.service = Some(v.to_string()),
            "scope" => ret.scope = Some(v.to_string()),
            _ => {}
        }
    }
    Some(ret)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn bearer_challenges() {
        // spacing variants from the distribution token auth docs
        let cases = [
            r#"Bearer realm="https://auth.docker.io/token",service="registry.docker.io",scope="repository:samalba/my-app:pull,push""#,
            r#"Bearer realm="https://auth.docker.io/token", service="registry.docker.io",scope="repository:samalba/my-app:pull,push""#,
            r#"Bearer realm="https://auth.docker.io/token", service="registry.docker.io", scope="repository:samalba/my-app:pull,push""#,
            r#"Bearer   service="registry.docker.io", scope="repository:samalba/my-app:pull,push",realm="https://auth.docker.io/token""#,
        ];
        for case in cases.iter() {
            let c = parse_challenge(case).unwrap();
            assert!(c.is_bearer(), "{case}");
            assert_eq!(c.realm.as_deref(), Some("https://auth.docker.io/token"));
            assert_eq!(c.service.as_deref(), Some("registry.docker.io"));
            assert_eq!(
                c.scope.as_deref(),
                Some("repository:samalba/my-app:pull,push")
            );
        }
    }

    #[test]
    fn basic_challenge() {
        let c = parse_challenge(r#"Basic realm="registry""#).unwrap();
        assert_eq!(c.scheme, "basic");
        assert!(!c.is_bearer());
        assert_eq!(c.realm.as_deref(), Some("registry"));
        assert_eq!(c.service, None);
    }

    #[test]
    fn bare_scheme() {
        let c = parse_challenge("Basic").unwrap();
        assert_eq!(c.scheme, "basic");
        assert_eq!(c.realm, None);
    }

    #[test]
    fn garbage_is_rejected() {
        assert_eq!(parse_challenge(""), None);
        assert_eq!(parse_challenge(r#"=realm"x""#), None);
    }
}
