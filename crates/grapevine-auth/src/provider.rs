// ABOUTME: Credential provider that runs each authentication flow over HTTP.
// ABOUTME: All flows resolve to the same SessionMetadata shape regardless of entry point.

use chrono::Utc;
use jsonwebtoken::{encode, Algorithm, EncodingKey, Header};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use url::Url;

use crate::config::AuthConfig;
use crate::error::AuthError;
use crate::session::{
    derive_organization_id, validate_instance_url, validate_organization_id, SessionMetadata,
};

const SOAP_LOGIN_PATH: &str = "/services/Soap/u/58.0";
const TOKEN_PATH: &str = "/services/oauth2/token";
const USERINFO_PATH: &str = "/services/oauth2/userinfo";

/// Lifetime of the signed JWT assertion, in seconds.
const ASSERTION_LIFETIME_SECS: i64 = 300;

/// Runs authentication flows and produces session metadata.
///
/// The provider holds a single `reqwest::Client` so connection pools are
/// shared across retries and flows.
#[derive(Debug, Clone, Default)]
pub struct CredentialProvider {
    http: reqwest::Client,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    instance_url: String,
}

#[derive(Debug, Deserialize)]
struct UserInfoResponse {
    organization_id: String,
    preferred_username: Option<String>,
}

#[derive(Debug, Serialize)]
struct AssertionClaims<'a> {
    iss: &'a str,
    sub: &'a str,
    aud: &'a str,
    exp: i64,
}

impl CredentialProvider {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run the flow selected by `config` and return the resulting session.
    pub async fn authenticate(&self, config: &AuthConfig) -> Result<SessionMetadata, AuthError> {
        debug!(mode = config.mode(), "starting authentication");
        let session = match config {
            AuthConfig::UsernamePassword {
                login_url,
                username,
                password,
                security_token,
            } => {
                self.login_username_password(
                    login_url,
                    username,
                    password,
                    security_token.as_deref(),
                )
                .await?
            }
            AuthConfig::ClientCredentials {
                login_url,
                client_id,
                client_secret,
            } => {
                let form = [
                    ("grant_type", "client_credentials"),
                    ("client_id", client_id.as_str()),
                    ("client_secret", client_secret.as_str()),
                ];
                let token = self.request_token(login_url, &form).await?;
                self.finish_oauth(token).await?
            }
            AuthConfig::JwtBearer {
                login_url,
                client_id,
                username,
                private_key_pem,
            } => {
                let assertion = sign_assertion(client_id, username, login_url, private_key_pem)?;
                let form = [
                    ("grant_type", "urn:ietf:params:oauth:grant-type:jwt-bearer"),
                    ("assertion", assertion.as_str()),
                ];
                let token = self.request_token(login_url, &form).await?;
                self.finish_oauth(token).await?
            }
            AuthConfig::UserSupplied {
                access_token,
                instance_url,
                organization_id,
            } => {
                let organization_id = match organization_id {
                    Some(id) => id.clone(),
                    None => derive_organization_id(access_token),
                };
                SessionMetadata {
                    access_token: access_token.clone(),
                    instance_url: instance_url.clone(),
                    organization_id,
                    username: None,
                }
            }
        };

        validate_organization_id(&session.organization_id)?;
        validate_instance_url(&session.instance_url)?;

        info!(
            mode = config.mode(),
            organization_id = %session.organization_id,
            instance_url = %session.instance_url,
            "authenticated"
        );
        Ok(session)
    }

    /// Session login against the SOAP endpoint. The security token, when
    /// present, is concatenated onto the password.
    async fn login_username_password(
        &self,
        login_url: &str,
        username: &str,
        password: &str,
        security_token: Option<&str>,
    ) -> Result<SessionMetadata, AuthError> {
        let mut secret = password.to_string();
        if let Some(token) = security_token {
            secret.push_str(token);
        }
        let envelope = login_envelope(username, &secret);

        let endpoint = format!("{}{SOAP_LOGIN_PATH}", login_url.trim_end_matches('/'));
        let response = self
            .http
            .post(&endpoint)
            .header("Content-Type", "text/xml;charset=UTF-8")
            .header("SOAPAction", "\"\"")
            .body(envelope)
            .send()
            .await?;

        let status = response.status();
        let body = response.text().await?;
        if !status.is_success() {
            return Err(AuthError::SessionLogin {
                status: status.as_u16(),
                body,
            });
        }

        let access_token = extract_tag(&body, "sessionId")
            .ok_or(AuthError::MissingField("sessionId"))?;
        let server_url = extract_tag(&body, "serverUrl")
            .ok_or(AuthError::MissingField("serverUrl"))?;
        let organization_id = extract_tag(&body, "organizationId")
            .ok_or(AuthError::MissingField("organizationId"))?;
        let username = extract_tag(&body, "userName");

        let instance_url = instance_origin(&server_url)?;

        Ok(SessionMetadata {
            access_token,
            instance_url,
            organization_id,
            username,
        })
    }

    /// POST a form to the OAuth token endpoint and parse the token reply.
    async fn request_token(
        &self,
        login_url: &str,
        form: &[(&str, &str)],
    ) -> Result<TokenResponse, AuthError> {
        let endpoint = format!("{}{TOKEN_PATH}", login_url.trim_end_matches('/'));
        let response = self.http.post(&endpoint).form(form).send().await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await?;
            return Err(AuthError::TokenEndpoint {
                status: status.as_u16(),
                body,
            });
        }
        let body = response.text().await?;
        serde_json::from_str(&body).map_err(|e| AuthError::InvalidResponse(e.to_string()))
    }

    /// Resolve tenant identity for an OAuth token via the user-info endpoint.
    async fn finish_oauth(&self, token: TokenResponse) -> Result<SessionMetadata, AuthError> {
        let endpoint = format!(
            "{}{USERINFO_PATH}",
            token.instance_url.trim_end_matches('/')
        );
        let response = self
            .http
            .get(&endpoint)
            .bearer_auth(&token.access_token)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await?;
            return Err(AuthError::UserInfo {
                status: status.as_u16(),
                body,
            });
        }
        let body = response.text().await?;
        let info: UserInfoResponse =
            serde_json::from_str(&body).map_err(|e| AuthError::InvalidResponse(e.to_string()))?;

        Ok(SessionMetadata {
            access_token: token.access_token,
            instance_url: token.instance_url,
            organization_id: info.organization_id,
            username: info.preferred_username,
        })
    }
}

/// Sign the RS256 assertion exchanged for an access token.
fn sign_assertion(
    client_id: &str,
    username: &str,
    login_url: &str,
    private_key_pem: &str,
) -> Result<String, AuthError> {
    let claims = AssertionClaims {
        iss: client_id,
        sub: username,
        aud: login_url,
        exp: Utc::now().timestamp() + ASSERTION_LIFETIME_SECS,
    };
    let key = EncodingKey::from_rsa_pem(private_key_pem.as_bytes())?;
    Ok(encode(&Header::new(Algorithm::RS256), &claims, &key)?)
}

/// Render the SOAP login envelope. Credentials are XML-escaped.
fn login_envelope(username: &str, password: &str) -> String {
    format!(
        "<?xml version=\"1.0\" encoding=\"utf-8\"?>\
         <soapenv:Envelope xmlns:soapenv=\"http://schemas.xmlsoap.org/soap/envelope/\" \
         xmlns:urn=\"urn:partner.soap.sforce.com\">\
         <soapenv:Body><urn:login>\
         <urn:username>{}</urn:username>\
         <urn:password>{}</urn:password>\
         </urn:login></soapenv:Body></soapenv:Envelope>",
        xml_escape(username),
        xml_escape(password)
    )
}

fn xml_escape(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&apos;"),
            _ => out.push(c),
        }
    }
    out
}

fn xml_unescape(value: &str) -> String {
    value
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&apos;", "'")
        .replace("&amp;", "&")
}

/// Pull the text content of the first `<tag>...</tag>` pair out of an XML
/// body. Enough for the flat login response; not a general XML parser.
fn extract_tag(body: &str, tag: &str) -> Option<String> {
    let open = format!("<{tag}>");
    let close = format!("</{tag}>");
    let start = body.find(&open)? + open.len();
    let end = body[start..].find(&close)? + start;
    Some(xml_unescape(&body[start..end]))
}

/// Reduce a SOAP server URL to its origin, which is the instance URL.
fn instance_origin(server_url: &str) -> Result<String, AuthError> {
    let url = Url::parse(server_url)
        .map_err(|e| AuthError::InvalidResponse(format!("bad serverUrl '{server_url}': {e}")))?;
    let host = url
        .host_str()
        .ok_or_else(|| AuthError::InvalidResponse(format!("serverUrl has no host: '{server_url}'")))?;
    match url.port() {
        Some(port) => Ok(format!("{}://{host}:{port}", url.scheme())),
        None => Ok(format!("{}://{host}", url.scheme())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_login_envelope_escapes_credentials() {
        let envelope = login_envelope("a&b@example.com", "p<w>d\"'");
        assert!(envelope.contains("<urn:username>a&amp;b@example.com</urn:username>"));
        assert!(envelope.contains("<urn:password>p&lt;w&gt;d&quot;&apos;</urn:password>"));
        assert!(envelope.contains("urn:partner.soap.sforce.com"));
    }

    #[test]
    fn test_extract_tag() {
        let body = "<result><sessionId>00D!token</sessionId>\
                    <serverUrl>https://na1.example.com/services/Soap/u/58.0/00D</serverUrl>\
                    </result>";
        assert_eq!(extract_tag(body, "sessionId").as_deref(), Some("00D!token"));
        assert_eq!(
            extract_tag(body, "serverUrl").as_deref(),
            Some("https://na1.example.com/services/Soap/u/58.0/00D")
        );
        assert_eq!(extract_tag(body, "organizationId"), None);
    }

    #[test]
    fn test_extract_tag_unescapes() {
        let body = "<userName>a&amp;b@example.com</userName>";
        assert_eq!(
            extract_tag(body, "userName").as_deref(),
            Some("a&b@example.com")
        );
    }

    #[test]
    fn test_instance_origin_strips_path() {
        assert_eq!(
            instance_origin("https://na1.example.com/services/Soap/u/58.0/00Dxx").unwrap(),
            "https://na1.example.com"
        );
        assert_eq!(
            instance_origin("https://na1.example.com:8443/path").unwrap(),
            "https://na1.example.com:8443"
        );
        assert!(instance_origin("not a url").is_err());
    }

    #[test]
    fn test_sign_assertion_rejects_garbage_key() {
        let err = sign_assertion("cid", "user", "https://login", "not a pem").unwrap_err();
        assert!(matches!(err, AuthError::Jwt(_)));
    }

    #[tokio::test]
    async fn test_user_supplied_derives_organization_id() {
        let provider = CredentialProvider::new();
        let config = AuthConfig::UserSupplied {
            access_token: "00D000000000001!AQEAxyz".to_string(),
            instance_url: "https://example.my.bus.com".to_string(),
            organization_id: None,
        };
        let session = provider.authenticate(&config).await.unwrap();
        assert_eq!(session.organization_id, "00D000000000001");
        assert_eq!(session.username, None);
    }

    #[tokio::test]
    async fn test_user_supplied_rejects_bad_organization_id() {
        let provider = CredentialProvider::new();
        let config = AuthConfig::UserSupplied {
            access_token: "short!rest".to_string(),
            instance_url: "https://example.my.bus.com".to_string(),
            organization_id: None,
        };
        let err = provider.authenticate(&config).await.unwrap_err();
        assert!(matches!(err, AuthError::InvalidOrganizationId { .. }));
    }

    #[tokio::test]
    async fn test_user_supplied_rejects_insecure_url() {
        let provider = CredentialProvider::new();
        let config = AuthConfig::UserSupplied {
            access_token: "00D000000000001!AQEAxyz".to_string(),
            instance_url: "http://example.my.bus.com".to_string(),
            organization_id: None,
        };
        let err = provider.authenticate(&config).await.unwrap_err();
        assert!(matches!(err, AuthError::InsecureInstanceUrl(_)));
    }

    #[tokio::test]
    async fn test_user_supplied_explicit_organization_id_wins() {
        let provider = CredentialProvider::new();
        let config = AuthConfig::UserSupplied {
            access_token: "whatever".to_string(),
            instance_url: "https://example.my.bus.com".to_string(),
            organization_id: Some("00D000000000001AAA".to_string()),
        };
        let session = provider.authenticate(&config).await.unwrap();
        assert_eq!(session.organization_id, "00D000000000001AAA");
    }
}
