//! Static routing config for the reference proxy binary: a YAML file mapping
//! method prefixes to backend address lists, the fan-out mode per prefix,
//! and whether that prefix's RPCs are unary (for the One2Many merge policy).
//!
//! `RawConfig` is the user-facing shape parsed with `serde_yaml`; `Config`
//! is the validated, internal shape `StaticDirector` is built from. Splitting
//! the two follows `agentgateway`'s `RawConfig`/`Config` pattern in its
//! `lib.rs`: user input stays permissive and easy to hand-edit, while the
//! internal type carries already-parsed addresses and an already-resolved
//! listen address.

use std::net::SocketAddr;

use grpc_proxy_core::Mode;

#[derive(serde::Deserialize, Clone, Debug, Default)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct RawConfig {
	/// Address the proxy itself listens on. Defaults to `0.0.0.0:9090`.
	listen_addr: Option<String>,
	#[serde(default)]
	routes: Vec<RawRoute>,
}

#[derive(serde::Deserialize, Clone, Debug)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
struct RawRoute {
	/// Method path prefix this route matches, e.g. `/pkg.Service/`.
	prefix: String,
	mode: RawMode,
	backends: Vec<String>,
	/// Whether this prefix's RPCs are unary, for the One2Many merge policy
	/// (§4.6). Ignored when `mode` is `oneToOne`. Defaults to `false`
	/// (streamed), the conservative choice.
	#[serde(default)]
	unary: bool,
}

#[derive(serde::Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
enum RawMode {
	OneToOne,
	OneToMany,
}

const DEFAULT_LISTEN_ADDR: &str = "0.0.0.0:9090";

/// One resolved routing rule: a method prefix, the mode to direct matching
/// calls with, and the backend addresses to dial.
#[derive(Clone, Debug)]
pub struct Route {
	pub prefix: String,
	pub mode: Mode,
	pub unary: bool,
	pub backend_addrs: Vec<String>,
}

#[derive(Clone, Debug)]
pub struct Config {
	pub listen_addr: SocketAddr,
	pub routes: Vec<Route>,
}

impl TryFrom<RawConfig> for Config {
	type Error = anyhow::Error;

	fn try_from(raw: RawConfig) -> Result<Self, Self::Error> {
		let listen_addr = raw
			.listen_addr
			.as_deref()
			.unwrap_or(DEFAULT_LISTEN_ADDR)
			.parse()?;

		let routes = raw
			.routes
			.into_iter()
			.map(|route| {
				if route.backends.is_empty() {
					anyhow::bail!("route {:?} lists no backends", route.prefix);
				}
				if route.mode == RawMode::OneToOne && route.backends.len() != 1 {
					anyhow::bail!(
						"route {:?} is oneToOne but lists {} backends",
						route.prefix,
						route.backends.len()
					);
				}
				Ok(Route {
					prefix: route.prefix,
					mode: match route.mode {
						RawMode::OneToOne => Mode::One2One,
						RawMode::OneToMany => Mode::One2Many,
					},
					unary: route.unary,
					backend_addrs: route.backends,
				})
			})
			.collect::<anyhow::Result<Vec<_>>>()?;

		Ok(Config {
			listen_addr,
			routes,
		})
	}
}
