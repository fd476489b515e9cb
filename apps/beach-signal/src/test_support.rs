//! Fixtures shared by the auth and websocket tests: a mock key set endpoint
//! and RS256 token minting.

use jsonwebtoken::{encode, get_current_timestamp, Algorithm, EncodingKey, Header};
use serde::Serialize;
use serde_json::{json, Value};
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

pub struct TestKey {
    pub kid: &'static str,
    pub pem: &'static str,
    pub n: &'static str,
    pub e: &'static str,
}

pub const PRIMARY_KEY: TestKey = TestKey {
    kid: "primary",
    pem: include_str!("../fixtures/primary_signing_key.pem"),
    n: "oGAe__UxHJVpZnnuy6dcXXWA9soDTZLTESYm7Mlhyfm_Imw0sS25drqb6mfvX1gAlQjaD-L_wkuol7uH3tHtncv6atEDL7v_XHdzucRUQMyjyloFfuiZ-vadXHBlTYsWXtS6-EtM8UbfbDk64v9RuJdh3p-0Kppziz4WcjRdw49z1e9iBwMWP00PheTQcWVAVVV_YU-ilkjQnlT5AeOF8R2Jl7P3sj8ZxAYRDJIuM05hPlsnXEmGJgF6ozJhlEw9dF1Xo_C4GowRjrH61NboQ5vpJygtn5y3jWkUuuZxHnKv4d1QowM3YNgz3v8YsI0_hXwE7zSZGmg5tlbRaACL0w",
    e: "AQAB",
};

pub const SECONDARY_KEY: TestKey = TestKey {
    kid: "secondary",
    pem: include_str!("../fixtures/secondary_signing_key.pem"),
    n: "nyVvblutgSfjDSPnTwmdZgZCOhizFq1n6LWvY9w1fh9Y9fMnBosS-KCDXtIM-inFV648x1WqlsPMm3KDzOcpq6I5vMckgH88iIyoXtgMsNzvJKVY_ZPPI48u6VxM4K34F0KMzxlMktJJx_0_uagXrpv8UFr8mnz_9aPgeppX3UEGfUwjMG63w2aCC04uvNe00QulJqa3Vp6SbbplcmfDbJ8oNBAHQa9r4yN4kvQj0nuZvjUS3fBUss09MiLG2fhrQ2APLkF7EanpOLy_DJ265e3qteoObR_wBGArzxGMRrFuQi5uGDWW8PLbVOf9YWKhKEYIOXuVfexKLjD0gSO_YQ",
    e: "AQAB",
};

pub fn jwks_for(keys: &[TestKey]) -> Value {
    let keys: Vec<Value> = keys
        .iter()
        .map(|key| {
            json!({
                "kty": "RSA",
                "kid": key.kid,
                "use": "sig",
                "alg": "RS256",
                "n": key.n,
                "e": key.e,
            })
        })
        .collect();
    json!({ "keys": keys })
}

#[derive(Debug, Serialize)]
pub struct TokenSpec {
    #[serde(skip_serializing_if = "Option::is_none")]
    sub: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    aud: Option<String>,
    exp: u64,
}

impl TokenSpec {
    pub fn subject(subject: &str) -> Self {
        Self {
            sub: Some(subject.to_string()),
            aud: None,
            exp: get_current_timestamp() + 600,
        }
    }

    pub fn anonymous() -> Self {
        Self {
            sub: None,
            aud: None,
            exp: get_current_timestamp() + 600,
        }
    }

    /// Past the default validation leeway
    pub fn expired(mut self) -> Self {
        self.exp = get_current_timestamp() - 3600;
        self
    }

    pub fn audience(mut self, audience: &str) -> Self {
        self.aud = Some(audience.to_string());
        self
    }
}

pub fn mint_token(key: &TestKey, claims: TokenSpec) -> String {
    let mut header = Header::new(Algorithm::RS256);
    header.kid = Some(key.kid.to_string());
    let encoding_key = EncodingKey::from_rsa_pem(key.pem.as_bytes()).unwrap();
    encode(&header, &claims, &encoding_key).unwrap()
}

/// Mock key set endpoint; dropping it shuts the server down
pub struct KeySetServer {
    server: MockServer,
}

impl KeySetServer {
    pub fn url(&self) -> String {
        format!("{}/.well-known/jwks.json", self.server.uri())
    }
}

pub async fn serve_json(body: Value) -> KeySetServer {
    serve(ResponseTemplate::new(200).set_body_json(body)).await
}

pub async fn serve_status(status: u16) -> KeySetServer {
    serve(ResponseTemplate::new(status)).await
}

async fn serve(response: ResponseTemplate) -> KeySetServer {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/.well-known/jwks.json"))
        .respond_with(response)
        .mount(&server)
        .await;
    KeySetServer { server }
}
