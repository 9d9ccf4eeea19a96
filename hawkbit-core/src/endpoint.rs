//! Controller endpoint: where this device lives on the update server.

/// Server base URL plus the tenant and controller identity embedded in every DDI path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    base: String,
    tenant: String,
    controller: String,
}

impl Endpoint {
    /// `server` is a host (`ota.example.com:8080`) or a full base URL. A bare host gets
    /// `https://` when `ssl` is set, else `http://`.
    pub fn new(server: &str, ssl: bool, tenant: &str, controller: &str) -> Self {
        let server = server.trim().trim_end_matches('/');
        let base = if server.contains("://") {
            server.to_string()
        } else if ssl {
            format!("https://{}", server)
        } else {
            format!("http://{}", server)
        };
        Self {
            base,
            tenant: tenant.to_string(),
            controller: controller.to_string(),
        }
    }

    pub fn base(&self) -> &str {
        &self.base
    }

    pub fn controller(&self) -> &str {
        &self.controller
    }

    /// Poll resource: `{base}/{tenant}/controller/v1/{controller}`.
    pub fn controller_url(&self) -> String {
        format!(
            "{}/{}/controller/v1/{}",
            self.base, self.tenant, self.controller
        )
    }

    pub fn config_data_url(&self) -> String {
        format!("{}/configData", self.controller_url())
    }

    pub fn deployment_feedback_url(&self, action_id: &str) -> String {
        format!(
            "{}/deploymentBase/{}/feedback",
            self.controller_url(),
            action_id
        )
    }

    pub fn cancel_feedback_url(&self, action_id: &str) -> String {
        format!("{}/cancelAction/{}/feedback", self.controller_url(), action_id)
    }
}
