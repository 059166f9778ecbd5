//! `Authorization` header parsing

use base64::Engine;

/// Basic auth user name whose password is an access token
pub const BASIC_TOKEN_USER: &str = "x-burrow-token";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Credentials {
    Bearer(String),
    Basic { username: String, password: String },
}

impl Credentials {
    /// Parse an `Authorization` header value
    pub fn parse(header: &str) -> Option<Self> {
        let (scheme, rest) = header.trim().split_once(' ')?;
        let rest = rest.trim();

        if scheme.eq_ignore_ascii_case("bearer") {
            return (!rest.is_empty()).then(|| Credentials::Bearer(rest.to_string()));
        }

        if scheme.eq_ignore_ascii_case("basic") {
            let decoded = base64::engine::general_purpose::STANDARD
                .decode(rest)
                .ok()?;
            let decoded = String::from_utf8(decoded).ok()?;
            let (username, password) = decoded.split_once(':')?;
            return Some(Credentials::Basic {
                username: username.to_string(),
                password: password.to_string(),
            });
        }

        None
    }

    /// The access token, if these credentials carry one
    pub fn into_token(self) -> Option<String> {
        match self {
            Credentials::Bearer(token) => Some(token),
            Credentials::Basic { username, password } if username == BASIC_TOKEN_USER => {
                (!password.is_empty()).then_some(password)
            }
            Credentials::Basic { .. } => None,
        }
    }
}

/// Extract a token from `Bearer <token>` or `Basic x-burrow-token:<token>`
pub fn token_from_authorization(header: &str) -> Option<String> {
    Credentials::parse(header).and_then(Credentials::into_token)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn basic(user_pass: &str) -> String {
        format!(
            "Basic {}",
            base64::engine::general_purpose::STANDARD.encode(user_pass)
        )
    }

    #[test]
    fn test_bearer() {
        assert_eq!(
            token_from_authorization("Bearer abc.def.ghi"),
            Some("abc.def.ghi".to_string())
        );
        assert_eq!(
            token_from_authorization("bearer   tok"),
            Some("tok".to_string())
        );
        assert_eq!(token_from_authorization("Bearer "), None);
    }

    #[test]
    fn test_basic_with_token_user() {
        assert_eq!(
            token_from_authorization(&basic("x-burrow-token:abc")),
            Some("abc".to_string())
        );
        assert_eq!(token_from_authorization(&basic("admin:abc")), None);
        assert_eq!(
            Credentials::parse(&basic("admin:pa:ss")),
            Some(Credentials::Basic {
                username: "admin".to_string(),
                password: "pa:ss".to_string()
            })
        );
    }

    #[test]
    fn test_garbage() {
        assert_eq!(Credentials::parse("Basic !!!"), None);
        assert_eq!(Credentials::parse("Digest foo"), None);
        assert_eq!(Credentials::parse(""), None);
    }
}
