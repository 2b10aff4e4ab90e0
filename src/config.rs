use std::env;

#[derive(Clone)]
pub struct SmtpConfig {
    pub host: String,
    pub port: Option<u16>,
    pub username: Option<String>,
    pub password: Option<String>,
}

#[derive(Clone)]
pub struct AppConfig {
    pub server_port: u16,
    pub sqlite_path: String,
    pub database_url: Option<String>,
    pub jwt_secret: String,
    pub token_header: String,
    pub token_ttl_days: i64,
    pub site_url: String,
    pub cors_origin: String,
    pub mail_from: String,
    pub smtp: Option<SmtpConfig>,
}

impl AppConfig {
    pub fn from_env() -> Self {
        let server_port = env::var("SERVER_PORT")
            .ok()
            .and_then(|v| v.parse::<u16>().ok())
            .unwrap_or(38321);

        let sqlite_path = env::var("SQLITE_PATH").unwrap_or_else(|_| "/opt/thankspress/data.sqlite".to_string());
        let database_url = env::var("DATABASE_URL").ok();

        let jwt_secret = env::var("JWT_SECRET").unwrap_or_else(|_| "xq3TnB8fKpW2cR7vLm9Z".to_string());
        let token_header = env::var("TOKEN_HEADER").unwrap_or_else(|_| "token".to_string());
        let token_ttl_days = env::var("TOKEN_TTL_DAYS")
            .ok()
            .and_then(|v| v.parse::<i64>().ok())
            .filter(|v| *v > 0)
            .unwrap_or(30);

        let site_url = env::var("SITE_URL")
            .map(|v| v.trim_end_matches('/').to_string())
            .unwrap_or_else(|_| format!("http://localhost:{}", server_port));
        let cors_origin = env::var("CORS_ORIGIN").unwrap_or_else(|_| "*".to_string());
        let mail_from = env::var("MAIL_FROM").unwrap_or_else(|_| "ThanksPress <noreply@thankspress.com>".to_string());

        let smtp = env::var("SMTP_HOST")
            .ok()
            .filter(|v| !v.trim().is_empty())
            .map(|host| SmtpConfig {
                host,
                port: env::var("SMTP_PORT").ok().and_then(|v| v.parse::<u16>().ok()),
                username: env::var("SMTP_USERNAME").ok(),
                password: env::var("SMTP_PASSWORD").ok(),
            });

        Self {
            server_port,
            sqlite_path,
            database_url,
            jwt_secret,
            token_header,
            token_ttl_days,
            site_url,
            cors_origin,
            mail_from,
            smtp,
        }
    }

    pub fn database_url(&self) -> String {
        if let Some(url) = &self.database_url {
            return url.clone();
        }

        let path = self.sqlite_path.trim();
        if path.starts_with("sqlite:") || path.starts_with("file:") {
            return path.to_string();
        }
        format!("sqlite://{}", path)
    }

    #[cfg(test)]
    pub fn for_tests() -> Self {
        Self {
            server_port: 0,
            sqlite_path: String::new(),
            database_url: Some("sqlite::memory:".to_string()),
            jwt_secret: "test-secret".to_string(),
            token_header: "token".to_string(),
            token_ttl_days: 1,
            site_url: "http://thankspress.test".to_string(),
            cors_origin: "*".to_string(),
            mail_from: "ThanksPress <noreply@thankspress.test>".to_string(),
            smtp: None,
        }
    }
}
