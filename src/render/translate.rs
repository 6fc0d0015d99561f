//! BulkRequest → driver script translation.
//!
//! Header values and the request body are pasted into string literals
//! as-is. A value containing quote characters can break out of the literal
//! and change the generated script.

use crate::error::ProtocolError;
use crate::protocol::{BulkRequest, HttpRequest, Scheme};
use crate::render::script;

/// Builds driver scripts; holds the fallbacks for missing headers.
#[derive(Debug, Clone)]
pub struct Translator {
    default_user_agent: String,
    default_accept: String,
}

impl Translator {
    pub fn new(default_user_agent: impl Into<String>, default_accept: impl Into<String>) -> Self {
        Self {
            default_user_agent: default_user_agent.into(),
            default_accept: default_accept.into(),
        }
    }

    /// Decode the embedded request and translate it.
    pub fn translate_bulk(&self, request: &BulkRequest) -> Result<String, ProtocolError> {
        let scheme = request.checked_scheme()?;
        let http = request.http_request()?;
        Ok(self.translate(scheme, &http))
    }

    /// Produce the script text for one request.
    ///
    /// Output order: `data` (POST only), `url`, setup, user agent, custom
    /// headers, load.
    pub fn translate(&self, scheme: Scheme, request: &HttpRequest) -> String {
        let host = request.header("Host").unwrap_or_default();
        let url = format!("{}://{}{}", scheme.as_str(), host, request.path());

        let user_agent = request
            .header("User-Agent")
            .unwrap_or_else(|| self.default_user_agent.as_str().into());

        let accept = request
            .header("Accept")
            .unwrap_or_else(|| self.default_accept.as_str().into());
        let mut custom_headers = format!("page.customHeaders = {{\"accept\": \"{}\"", accept);
        if let Some(cookie) = request.header("Cookie") {
            custom_headers.push_str(&format!(", \"cookie\": \"{}\"", cookie));
        }
        if let Some(content_type) = request.header("Content-Type") {
            custom_headers.push_str(&format!(", \"content-type\": \"{}\"", content_type));
        }
        custom_headers.push_str("};\n");

        // Any occurrence in the start line selects the POST template.
        let is_post = request.first_line().contains("POST");

        let mut out = String::new();
        if is_post {
            out.push_str(&format!(
                "data = \"{}\";\n",
                String::from_utf8_lossy(request.body())
            ));
        }
        out.push_str(&format!("url = \"{}\";\n", url));
        out.push_str(script::SETUP);
        out.push_str(&format!("page.settings.userAgent = '{}';\n", user_agent));
        out.push_str(&custom_headers);
        out.push_str(if is_post { script::LOAD_POST } else { script::LOAD });
        out
    }
}

impl Default for Translator {
    fn default() -> Self {
        Self::new(script::DEFAULT_USER_AGENT, script::DEFAULT_ACCEPT)
    }
}
