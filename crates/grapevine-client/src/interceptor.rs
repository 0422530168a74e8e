// ABOUTME: tonic interceptor attaching session credentials to every RPC.
// ABOUTME: The bus authenticates each call from accesstoken/instanceurl/tenantid metadata.

use grapevine_auth::SessionMetadata;
use tonic::metadata::MetadataValue;
use tonic::service::Interceptor;
use tonic::{Request, Status};

/// Inserts the session's credentials as ASCII metadata on each request.
#[derive(Debug, Clone)]
pub struct SessionInterceptor {
    access_token: MetadataValue<tonic::metadata::Ascii>,
    instance_url: MetadataValue<tonic::metadata::Ascii>,
    tenant_id: MetadataValue<tonic::metadata::Ascii>,
}

impl SessionInterceptor {
    /// Build an interceptor from session metadata.
    ///
    /// Fails when a value contains characters not representable as ASCII
    /// header values.
    pub fn new(session: &SessionMetadata) -> Result<Self, crate::error::ClientError> {
        let parse = |name: &str, value: &str| {
            MetadataValue::try_from(value).map_err(|e| {
                crate::error::ClientError::InvalidMetadata(format!("{name}: {e}"))
            })
        };
        Ok(Self {
            access_token: parse("accesstoken", &session.access_token)?,
            instance_url: parse("instanceurl", &session.instance_url)?,
            tenant_id: parse("tenantid", &session.organization_id)?,
        })
    }
}

impl Interceptor for SessionInterceptor {
    fn call(&mut self, mut request: Request<()>) -> Result<Request<()>, Status> {
        let metadata = request.metadata_mut();
        metadata.insert("accesstoken", self.access_token.clone());
        metadata.insert("instanceurl", self.instance_url.clone());
        metadata.insert("tenantid", self.tenant_id.clone());
        Ok(request)
    }
}
