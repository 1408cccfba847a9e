use serde::{Deserialize, Serialize};
use std::fmt;

/// Declarative firewall table: the unit a reconciliation pass works on.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Table {
    pub name: String,
    pub family: Family,
    #[serde(default)]
    pub chains: Vec<Chain>,
    #[serde(default)]
    pub sets: Vec<Set>,
}

impl Table {
    pub fn new(name: &str, family: Family) -> Self {
        Self {
            name: name.to_string(),
            family,
            chains: vec![],
            sets: vec![],
        }
    }

    pub fn chain(&self, name: &str) -> Option<&Chain> {
        self.chains.iter().find(|c| c.name == name)
    }

    pub fn set(&self, name: &str) -> Option<&Set> {
        self.sets.iter().find(|s| s.name == name)
    }

    pub fn from_yaml(yaml: &str) -> anyhow::Result<Self> {
        Ok(serde_yaml::from_str(yaml)?)
    }

    pub fn from_json(json: &str) -> anyhow::Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    /// Decode a table from a `.json` file, or YAML for any other extension
    pub fn from_file(path: &std::path::Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        match path.extension().and_then(|e| e.to_str()) {
            Some("json") => Self::from_json(&content),
            _ => Self::from_yaml(&content),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Family {
    Inet,
    Ipv4,
    Ipv6,
    Arp,
    Netdev,
    Bridge,
}

impl Family {
    /// Name used by the nft tool for this family
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Inet => "inet",
            Self::Ipv4 => "ip",
            Self::Ipv6 => "ip6",
            Self::Arp => "arp",
            Self::Netdev => "netdev",
            Self::Bridge => "bridge",
        }
    }

    /// NFPROTO_* value carried in every nfnetlink message
    pub fn nfproto(&self) -> u8 {
        match self {
            Self::Inet => 1,
            Self::Ipv4 => 2,
            Self::Arp => 3,
            Self::Netdev => 5,
            Self::Bridge => 7,
            Self::Ipv6 => 10,
        }
    }

    /// Accepts both the nft tool name (`ip6`) and the specification name (`IPV6`)
    pub fn parse(value: &str) -> Option<Self> {
        match value.to_ascii_lowercase().as_str() {
            "inet" => Some(Self::Inet),
            "ip" | "ipv4" => Some(Self::Ipv4),
            "ip6" | "ipv6" => Some(Self::Ipv6),
            "arp" => Some(Self::Arp),
            "netdev" => Some(Self::Netdev),
            "bridge" => Some(Self::Bridge),
            _ => None,
        }
    }

    pub fn from_nfproto(value: u8) -> Option<Self> {
        match value {
            1 => Some(Self::Inet),
            2 => Some(Self::Ipv4),
            3 => Some(Self::Arp),
            5 => Some(Self::Netdev),
            7 => Some(Self::Bridge),
            10 => Some(Self::Ipv6),
            _ => None,
        }
    }

    /// Whether addresses of this IP version can be matched in a table of this family.
    /// ARP only carries IPv4 protocol addresses.
    pub fn carries(&self, addr: &std::net::IpAddr) -> bool {
        match (self, addr) {
            (Self::Ipv4 | Self::Arp, std::net::IpAddr::V6(_)) => false,
            (Self::Ipv6, std::net::IpAddr::V4(_)) => false,
            _ => true,
        }
    }
}

impl fmt::Display for Family {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChainType {
    Filter,
    Route,
    Nat,
}

impl ChainType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Filter => "filter",
            Self::Route => "route",
            Self::Nat => "nat",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "filter" => Some(Self::Filter),
            "route" => Some(Self::Route),
            "nat" => Some(Self::Nat),
            _ => None,
        }
    }
}

impl fmt::Display for ChainType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChainHook {
    Prerouting,
    Input,
    Forward,
    Output,
    Postrouting,
    Ingress,
}

impl ChainHook {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Prerouting => "prerouting",
            Self::Input => "input",
            Self::Forward => "forward",
            Self::Output => "output",
            Self::Postrouting => "postrouting",
            Self::Ingress => "ingress",
        }
    }

    /// Kernel hook number. ARP and netdev number their hooks separately.
    pub fn hooknum(&self, family: Family) -> u32 {
        match (family, self) {
            (Family::Arp, Self::Input) => 0,
            (Family::Arp, Self::Output) => 1,
            (Family::Arp, Self::Forward) => 2,
            (Family::Netdev, Self::Ingress) => 0,
            (_, Self::Prerouting) => 0,
            (_, Self::Input) => 1,
            (_, Self::Forward) => 2,
            (_, Self::Output) => 3,
            (_, Self::Postrouting) => 4,
            (_, Self::Ingress) => 5,
        }
    }

    pub fn from_hooknum(family: Family, num: u32) -> Option<Self> {
        match (family, num) {
            (Family::Arp, 0) => Some(Self::Input),
            (Family::Arp, 1) => Some(Self::Output),
            (Family::Arp, 2) => Some(Self::Forward),
            (Family::Arp, _) => None,
            (Family::Netdev, 0) => Some(Self::Ingress),
            (Family::Netdev, _) => None,
            (_, 0) => Some(Self::Prerouting),
            (_, 1) => Some(Self::Input),
            (_, 2) => Some(Self::Forward),
            (_, 3) => Some(Self::Output),
            (_, 4) => Some(Self::Postrouting),
            (Family::Inet, 5) => Some(Self::Ingress),
            _ => None,
        }
    }
}

impl fmt::Display for ChainHook {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChainPolicy {
    Drop,
    Accept,
}

impl ChainPolicy {
    /// Verdict code stored as the chain policy (NF_DROP / NF_ACCEPT)
    pub fn verdict(&self) -> u32 {
        match self {
            Self::Drop => 0,
            Self::Accept => 1,
        }
    }

    pub fn from_verdict(code: u32) -> Option<Self> {
        match code {
            0 => Some(Self::Drop),
            1 => Some(Self::Accept),
            _ => None,
        }
    }
}

/// Base chain attached to a hook. Exclusively owned by its table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Chain {
    pub name: String,
    #[serde(rename = "type")]
    pub chain_type: ChainType,
    pub hook: ChainHook,
    /// Defaults to 0, the "filter" priority
    #[serde(default)]
    pub priority: i32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub policy: Option<ChainPolicy>,
    #[serde(default)]
    pub rules: RulesSet,
}

impl Chain {
    pub fn new(name: &str, chain_type: ChainType, hook: ChainHook) -> Self {
        Self {
            name: name.to_string(),
            chain_type,
            hook,
            priority: 0,
            policy: None,
            rules: RulesSet::default(),
        }
    }
}

/// Holds at most one populated rule list; which one must agree with the chain type.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RulesSet {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nat_rules: Option<Vec<NatRule>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filter_rules: Option<Vec<FilterRule>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub route_rules: Option<Vec<RouteRule>>,
}

impl RulesSet {
    pub fn filter(rules: Vec<FilterRule>) -> Self {
        Self {
            filter_rules: Some(rules),
            ..Self::default()
        }
    }

    pub fn nat(rules: Vec<NatRule>) -> Self {
        Self {
            nat_rules: Some(rules),
            ..Self::default()
        }
    }

    pub fn route(rules: Vec<RouteRule>) -> Self {
        Self {
            route_rules: Some(rules),
            ..Self::default()
        }
    }

    /// Rule kinds with a non-empty list
    pub fn populated_kinds(&self) -> Vec<ChainType> {
        let mut kinds = Vec::new();
        if self.filter_rules.as_ref().is_some_and(|r| !r.is_empty()) {
            kinds.push(ChainType::Filter);
        }
        if self.route_rules.as_ref().is_some_and(|r| !r.is_empty()) {
            kinds.push(ChainType::Route);
        }
        if self.nat_rules.as_ref().is_some_and(|r| !r.is_empty()) {
            kinds.push(ChainType::Nat);
        }
        kinds
    }

    /// All rules in declaration order, filter rules first, then route, then nat
    pub fn rules(&self) -> Vec<RuleRef<'_>> {
        let mut rules = Vec::new();
        for rule in self.filter_rules.iter().flatten() {
            rules.push(RuleRef::Filter(rule));
        }
        for rule in self.route_rules.iter().flatten() {
            rules.push(RuleRef::Route(rule));
        }
        for rule in self.nat_rules.iter().flatten() {
            rules.push(RuleRef::Nat(rule));
        }
        rules
    }

    pub fn names_mut(&mut self) -> Vec<&mut Option<String>> {
        let mut names = Vec::new();
        for rule in self.filter_rules.iter_mut().flatten() {
            names.push(&mut rule.name);
        }
        for rule in self.route_rules.iter_mut().flatten() {
            names.push(&mut rule.name);
        }
        for rule in self.nat_rules.iter_mut().flatten() {
            names.push(&mut rule.name);
        }
        names
    }

    pub fn is_empty(&self) -> bool {
        self.populated_kinds().is_empty()
    }
}

/// Borrowed view over one rule of any kind.
#[derive(Debug, Clone, Copy)]
pub enum RuleRef<'a> {
    Filter(&'a FilterRule),
    Nat(&'a NatRule),
    Route(&'a RouteRule),
}

impl<'a> RuleRef<'a> {
    pub fn name(&self) -> Option<&'a str> {
        match self {
            Self::Filter(r) => r.name.as_deref(),
            Self::Nat(r) => r.name.as_deref(),
            Self::Route(r) => r.name.as_deref(),
        }
    }

    pub fn matches(&self) -> &'a [Match] {
        match self {
            Self::Filter(r) => &r.matches,
            Self::Nat(r) => &r.matches,
            Self::Route(r) => &r.matches,
        }
    }

    pub fn kind(&self) -> ChainType {
        match self {
            Self::Filter(_) => ChainType::Filter,
            Self::Nat(_) => ChainType::Nat,
            Self::Route(_) => ChainType::Route,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FilterRule {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, rename = "match")]
    pub matches: Vec<Match>,
    pub action: FilterAction,
    /// Mark for `ctmark`, MSS for `tcpmssclamp`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FilterAction {
    #[serde(rename = "ctmark")]
    CtMark,
    #[serde(rename = "metamarkfromctmark")]
    SetMetaMarkFromCtMark,
    #[serde(rename = "accept")]
    Accept,
    #[serde(rename = "drop")]
    Drop,
    #[serde(rename = "tcpmssclamp")]
    TcpMssClamp,
}

impl fmt::Display for FilterAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::CtMark => "ctmark",
            Self::SetMetaMarkFromCtMark => "metamarkfromctmark",
            Self::Accept => "accept",
            Self::Drop => "drop",
            Self::TcpMssClamp => "tcpmssclamp",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NatRule {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, rename = "match")]
    pub matches: Vec<Match>,
    pub nat_type: NatType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub to: Option<String>,
    /// Carried through untouched; the engine never interprets it
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_ref: Option<TargetRef>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NatType {
    Dnat,
    Snat,
    Masquerade,
}

impl fmt::Display for NatType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Dnat => "dnat",
            Self::Snat => "snat",
            Self::Masquerade => "masquerade",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TargetRef {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

/// Policy-routing rule. Accepted by the model, not yet compiled.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RouteRule {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, rename = "match")]
    pub matches: Vec<Match>,
}

/// One ANDed condition; exactly one of `ip`, `port`, `dev`, `proto` is set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Match {
    pub op: MatchOp,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ip: Option<MatchIp>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<MatchPort>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dev: Option<MatchDev>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub proto: Option<MatchProto>,
}

/// Populated discriminant of a [`Match`].
#[derive(Debug, Clone, Copy)]
pub enum MatchKind<'a> {
    Ip(&'a MatchIp),
    Port(&'a MatchPort),
    Dev(&'a MatchDev),
    Proto(&'a MatchProto),
}

impl Match {
    pub fn ip(op: MatchOp, value: &str, position: IpPosition) -> Self {
        Self {
            op,
            ip: Some(MatchIp {
                value: value.to_string(),
                position,
            }),
            port: None,
            dev: None,
            proto: None,
        }
    }

    pub fn port(op: MatchOp, value: &str, position: PortPosition) -> Self {
        Self {
            op,
            ip: None,
            port: Some(MatchPort {
                value: value.to_string(),
                position,
            }),
            dev: None,
            proto: None,
        }
    }

    pub fn dev(op: MatchOp, value: &str, position: DevPosition) -> Self {
        Self {
            op,
            ip: None,
            port: None,
            dev: Some(MatchDev {
                value: value.to_string(),
                position,
            }),
            proto: None,
        }
    }

    pub fn proto(op: MatchOp, value: L4Proto) -> Self {
        Self {
            op,
            ip: None,
            port: None,
            dev: None,
            proto: Some(MatchProto { value }),
        }
    }

    pub fn populated(&self) -> usize {
        [
            self.ip.is_some(),
            self.port.is_some(),
            self.dev.is_some(),
            self.proto.is_some(),
        ]
        .into_iter()
        .filter(|set| *set)
        .count()
    }

    /// The single populated discriminant, or `None` when zero or several are set
    pub fn kind(&self) -> Option<MatchKind<'_>> {
        if self.populated() != 1 {
            return None;
        }
        if let Some(ip) = &self.ip {
            return Some(MatchKind::Ip(ip));
        }
        if let Some(port) = &self.port {
            return Some(MatchKind::Port(port));
        }
        if let Some(dev) = &self.dev {
            return Some(MatchKind::Dev(dev));
        }
        self.proto.as_ref().map(MatchKind::Proto)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MatchOp {
    Eq,
    Neq,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MatchIp {
    pub value: String,
    pub position: IpPosition,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IpPosition {
    Src,
    Dst,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MatchPort {
    /// Single port or dash-separated inclusive range
    pub value: String,
    pub position: PortPosition,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PortPosition {
    Src,
    Dst,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MatchDev {
    pub value: String,
    pub position: DevPosition,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DevPosition {
    In,
    Out,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MatchProto {
    pub value: L4Proto,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum L4Proto {
    Tcp,
    Udp,
}

impl L4Proto {
    /// IANA protocol number
    pub fn number(&self) -> u8 {
        match self {
            Self::Tcp => 6,
            Self::Udp => 17,
        }
    }
}

/// Named kernel set (or map, when `data_type` is set) owned by a table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Set {
    pub name: String,
    pub key_type: SetDataType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data_type: Option<SetDataType>,
    #[serde(default)]
    pub elements: Vec<SetElement>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SetElement {
    pub key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SetDataType {
    #[serde(rename = "ipv4_addr")]
    Ipv4Addr,
}

impl SetDataType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ipv4Addr => "ipv4_addr",
        }
    }

    /// nftables datatype identifier (TYPE_IPADDR)
    pub fn type_id(&self) -> u32 {
        match self {
            Self::Ipv4Addr => 7,
        }
    }

    pub fn from_type_id(id: u32) -> Option<Self> {
        match id {
            7 => Some(Self::Ipv4Addr),
            _ => None,
        }
    }

    pub fn len(&self) -> u32 {
        match self {
            Self::Ipv4Addr => 4,
        }
    }

    /// Encode a textual element key or datum as kernel bytes
    pub fn encode(&self, value: &str) -> Result<Vec<u8>, crate::value::ValueError> {
        match self {
            Self::Ipv4Addr => {
                let addr: std::net::Ipv4Addr = value
                    .trim()
                    .parse()
                    .map_err(|_| crate::value::ValueError::InvalidIp(value.to_string()))?;
                Ok(addr.octets().to_vec())
            }
        }
    }
}

impl fmt::Display for SetDataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
