//! Aviosys IP Power 9258 Network Power Switch Driver
//!
//! Reference: IP Power 9258 User Manual, "HTTP API"
//!
//! Protocol Overview:
//! - HTTP GET against `/set.cmd` with basic auth (default `admin`/`12345678`)
//! - `cmd=getpower` answers with every outlet: `p61=1,p62=0,p63=1,p64=0`
//!   (wrapped in a minimal HTML page on most firmware)
//! - `cmd=setpower+p6<n>=<0|1>` switches outlet n and answers with its new
//!   state
//! - `cmd=setpowercycle+p6<n>=<s>` turns outlet n off for s seconds
//!
//! Outlets are numbered 1..4.

use std::collections::HashMap;
use std::sync::{Arc, LazyLock};
use std::time::Duration;

use async_trait::async_trait;
use futures::future::BoxFuture;
use lab_core::http::{Credentials, HttpTransport};
use lab_core::{
    Action, Capability, DeviceCategory, DeviceComponents, DictFeat, DriverFactory, FeatSet,
    Instrument, LabError, Result,
};
use regex::Regex;
use serde::Deserialize;
use serde_json::Value;
use tracing::instrument;

pub const OUTLETS: [u8; 4] = [1, 2, 3, 4];

const DEFAULT_CYCLE_SECONDS: u32 = 5;

#[derive(Debug, Clone, Deserialize)]
pub struct IpPower9258Config {
    /// e.g. `http://192.168.0.100`
    pub url: String,
    #[serde(default = "default_username")]
    pub username: String,
    #[serde(default = "default_password")]
    pub password: String,
    #[serde(default)]
    pub timeout_ms: Option<u64>,
}

fn default_username() -> String {
    "admin".to_string()
}

fn default_password() -> String {
    "12345678".to_string()
}

impl IpPower9258Config {
    fn transport(&self) -> Result<HttpTransport> {
        let timeout = Duration::from_millis(self.timeout_ms.unwrap_or(3000));
        Ok(HttpTransport::with_timeout(&self.url, "IP Power 9258", timeout)?.with_credentials(
            Credentials {
                username: self.username.clone(),
                password: self.password.clone(),
            },
        ))
    }
}

pub struct IpPower9258Factory;

static IPPOWER_CAPABILITIES: &[Capability] = &[];

impl DriverFactory for IpPower9258Factory {
    fn driver_type(&self) -> &'static str {
        "ippower9258"
    }

    fn name(&self) -> &'static str {
        "Aviosys IP Power 9258"
    }

    fn capabilities(&self) -> &'static [Capability] {
        IPPOWER_CAPABILITIES
    }

    fn validate(&self, config: &toml::Value) -> anyhow::Result<()> {
        let cfg: IpPower9258Config = lab_core::parse_config(self.driver_type(), config)?;
        cfg.transport()?;
        Ok(())
    }

    fn build(&self, config: toml::Value) -> BoxFuture<'static, anyhow::Result<DeviceComponents>> {
        Box::pin(async move {
            let cfg: IpPower9258Config = lab_core::parse_config("ippower9258", &config)?;
            let driver = Arc::new(IpPower9258Driver::new(cfg.transport()?));
            Ok(DeviceComponents::new().with_instrument(driver))
        })
    }
}

/// `p6<n>=<state>` pairs in getpower/setpower replies.
#[allow(clippy::expect_used)]
static OUTLET_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"p6([1-4])\s*=\s*([01])").expect("Invalid outlet regex"));

/// Outlet states found in a reply body.
pub fn parse_outlets(body: &str) -> HashMap<u8, bool> {
    OUTLET_REGEX
        .captures_iter(body)
        .filter_map(|c| {
            let outlet = c.get(1)?.as_str().parse().ok()?;
            Some((outlet, c.get(2)?.as_str() == "1"))
        })
        .collect()
}

fn outlet_state(http: &HttpTransport, request: &str, body: &str, outlet: u8) -> Result<bool> {
    parse_outlets(body).get(&outlet).copied().ok_or_else(|| {
        LabError::parse(
            http.name(),
            request,
            body,
            format!("no state for outlet {outlet}"),
        )
    })
}

#[derive(Debug, Deserialize)]
struct CycleArgs {
    outlet: u8,
    #[serde(default)]
    seconds: Option<u32>,
}

pub struct IpPower9258Driver {
    http: Arc<HttpTransport>,
    /// Outlet power state
    pub outlet: DictFeat<u8, bool>,
    feats: FeatSet,
}

impl IpPower9258Driver {
    pub fn new(http: HttpTransport) -> Self {
        let http = Arc::new(http);

        let outlet = DictFeat::<u8, bool>::new("outlet")
            .describe("Mains outlet on/off")
            .with_keys(OUTLETS)
            .with_reader({
                let http = Arc::clone(&http);
                move |n: u8| -> BoxFuture<'static, Result<bool>> {
                    let http = Arc::clone(&http);
                    Box::pin(async move {
                        let request = "set.cmd?cmd=getpower";
                        let body = http.get(request).await?;
                        outlet_state(&http, request, &body, n)
                    })
                }
            })
            .with_writer({
                let http = Arc::clone(&http);
                move |n: u8, on: bool| -> BoxFuture<'static, Result<()>> {
                    let http = Arc::clone(&http);
                    Box::pin(async move {
                        let request = format!("set.cmd?cmd=setpower+p6{n}={}", u8::from(on));
                        let body = http.get(&request).await?;
                        if outlet_state(&http, &request, &body, n)? != on {
                            return Err(LabError::instrument(
                                http.name(),
                                format!("outlet {n} did not switch {}", if on { "on" } else { "off" }),
                            ));
                        }
                        Ok(())
                    })
                }
            });

        let mut feats = FeatSet::new();
        feats.register(outlet.clone());

        let cycle_http = Arc::clone(&http);
        let cycle_outlet = outlet.clone();
        feats.register_action(
            Action::new("cycle", move |args| {
                let http = Arc::clone(&cycle_http);
                let outlet = cycle_outlet.clone();
                Box::pin(async move {
                    let args: CycleArgs = Action::args(args)?;
                    outlet.check_key(&args.outlet)?;
                    let seconds = args.seconds.unwrap_or(DEFAULT_CYCLE_SECONDS);
                    let request =
                        format!("set.cmd?cmd=setpowercycle+p6{}={seconds}", args.outlet);
                    http.get(&request).await?;
                    outlet.invalidate();
                    tracing::info!(device = %http.name(), outlet = args.outlet, seconds, "power cycle");
                    Ok(Value::Null)
                })
            })
            .describe("Turn an outlet off for `seconds` (default 5), then back on"),
        );

        Self { http, outlet, feats }
    }

    /// State of every outlet from a single request.
    #[instrument(skip(self), fields(device = %self.name()), err)]
    pub async fn outlets(&self) -> Result<HashMap<u8, bool>> {
        Ok(parse_outlets(&self.http.get("set.cmd?cmd=getpower").await?))
    }
}

#[async_trait]
impl Instrument for IpPower9258Driver {
    fn name(&self) -> &str {
        self.http.name()
    }

    fn feats(&self) -> &FeatSet {
        &self.feats
    }

    fn category(&self) -> Option<DeviceCategory> {
        Some(DeviceCategory::PowerSwitch)
    }

    #[instrument(skip(self), fields(device = %self.name()), err)]
    async fn initialize(&self) -> Result<()> {
        let states = self.outlets().await?;
        if states.len() != OUTLETS.len() {
            return Err(LabError::instrument(
                self.name(),
                format!("getpower reported {} of 4 outlets", states.len()),
            ));
        }
        tracing::info!(device = %self.name(), ?states, "IP Power ready");
        Ok(())
    }
}
