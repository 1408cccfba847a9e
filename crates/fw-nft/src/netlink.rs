// Kernel transport: nf_tables over a NETLINK_NETFILTER socket
use anyhow::{Context, Result};
use fw_core::{ChainHook, ChainPolicy, ChainType, Family, SetDataType};
use netlink_sys::{
    AsyncSocket, AsyncSocketExt, SocketAddr, TokioSocket, protocols::NETLINK_NETFILTER,
};
use std::collections::HashMap;
use std::io;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};

use crate::conn::NftConn;
use crate::expr::Expr;
use crate::nla::{
    Attrs, DecodeError, NFTA_DATA_VALUE, NFTA_LIST_ELEM, nla_align, push_attr_bytes,
    push_attr_nested, push_attr_str, push_attr_u32, push_attr_u64,
};
use crate::table::{LiveChain, LiveRule, LiveSet, LiveSetElement, LiveTable};

const NLMSG_HDRLEN: usize = 16;
const NFGENMSG_LEN: usize = 4;

const NLMSG_ERROR: u16 = 2;
const NLMSG_DONE: u16 = 3;

const NLM_F_REQUEST: u16 = 0x01;
const NLM_F_ACK: u16 = 0x04;
const NLM_F_ROOT: u16 = 0x100;
const NLM_F_MATCH: u16 = 0x200;
const NLM_F_DUMP: u16 = NLM_F_ROOT | NLM_F_MATCH;
const NLM_F_CREATE: u16 = 0x400;
const NLM_F_APPEND: u16 = 0x800;

const NFNETLINK_V0: u8 = 0;
const NFNL_SUBSYS_NFTABLES: u16 = 10;
const NFNL_MSG_BATCH_BEGIN: u16 = 16;
const NFNL_MSG_BATCH_END: u16 = 17;
const AF_UNSPEC: u8 = 0;

const NFT_MSG_NEWTABLE: u16 = 0;
const NFT_MSG_GETTABLE: u16 = 1;
const NFT_MSG_DELTABLE: u16 = 2;
const NFT_MSG_NEWCHAIN: u16 = 3;
const NFT_MSG_GETCHAIN: u16 = 4;
const NFT_MSG_DELCHAIN: u16 = 5;
const NFT_MSG_NEWRULE: u16 = 6;
const NFT_MSG_GETRULE: u16 = 7;
const NFT_MSG_DELRULE: u16 = 8;
const NFT_MSG_NEWSET: u16 = 9;
const NFT_MSG_GETSET: u16 = 10;
const NFT_MSG_DELSET: u16 = 11;
const NFT_MSG_NEWSETELEM: u16 = 12;
const NFT_MSG_GETSETELEM: u16 = 13;
const NFT_MSG_DELSETELEM: u16 = 14;

const NFTA_TABLE_NAME: u16 = 1;

const NFTA_CHAIN_TABLE: u16 = 1;
const NFTA_CHAIN_NAME: u16 = 3;
const NFTA_CHAIN_HOOK: u16 = 4;
const NFTA_CHAIN_POLICY: u16 = 5;
const NFTA_CHAIN_TYPE: u16 = 7;
const NFTA_HOOK_HOOKNUM: u16 = 1;
const NFTA_HOOK_PRIORITY: u16 = 2;

const NFTA_RULE_TABLE: u16 = 1;
const NFTA_RULE_CHAIN: u16 = 2;
const NFTA_RULE_HANDLE: u16 = 3;
const NFTA_RULE_EXPRESSIONS: u16 = 4;
const NFTA_RULE_USERDATA: u16 = 7;

const NFTA_SET_TABLE: u16 = 1;
const NFTA_SET_NAME: u16 = 2;
const NFTA_SET_FLAGS: u16 = 3;
const NFTA_SET_KEY_TYPE: u16 = 4;
const NFTA_SET_KEY_LEN: u16 = 5;
const NFTA_SET_DATA_TYPE: u16 = 6;
const NFTA_SET_DATA_LEN: u16 = 7;
const NFT_SET_ANONYMOUS: u32 = 0x1;
const NFT_SET_MAP: u32 = 0x8;

const NFTA_SET_ELEM_LIST_TABLE: u16 = 1;
const NFTA_SET_ELEM_LIST_SET: u16 = 2;
const NFTA_SET_ELEM_LIST_ELEMENTS: u16 = 3;
const NFTA_SET_ELEM_KEY: u16 = 1;
const NFTA_SET_ELEM_DATA: u16 = 2;

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Error)]
pub enum NetlinkError {
    #[error("kernel error: {0}")]
    Kernel(io::Error),

    #[error("no reply from the kernel within {0:?}")]
    Timeout(Duration),

    #[error(transparent)]
    Decode(#[from] DecodeError),
}

impl NetlinkError {
    /// errno reported by the kernel, if this is a kernel rejection
    pub fn errno(&self) -> Option<i32> {
        match self {
            Self::Kernel(err) => err.raw_os_error(),
            _ => None,
        }
    }
}

/// One queued nf_tables mutation
#[derive(Debug, Clone, PartialEq, Eq)]
struct Request {
    msg_type: u16,
    flags: u16,
    family: u8,
    attrs: Vec<u8>,
    /// What the message does, for error reports
    what: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Message {
    msg_type: u16,
    seq: u32,
    payload: Vec<u8>,
}

impl Message {
    /// Family from the nfgenmsg header and the attributes after it
    fn nft_body(&self) -> Result<(Family, Attrs<'_>), DecodeError> {
        if self.payload.len() < NFGENMSG_LEN {
            return Err(DecodeError::Truncated("nfgenmsg"));
        }
        let family =
            Family::from_nfproto(self.payload[0]).ok_or(DecodeError::Malformed("nfgenmsg family"))?;
        Ok((family, Attrs::parse(&self.payload[NFGENMSG_LEN..])?))
    }
}

/// [`NftConn`] backed by the running kernel. Needs CAP_NET_ADMIN.
pub struct NetlinkConn {
    socket: TokioSocket,
    seq: u32,
    batch: Vec<Request>,
    timeout: Duration,
}

impl NetlinkConn {
    /// Open and bind a netfilter socket. Must be called inside a tokio runtime.
    pub fn connect() -> Result<Self> {
        let mut socket =
            TokioSocket::new(NETLINK_NETFILTER).context("Failed to create netlink socket")?;
        socket
            .socket_mut()
            .bind_auto()
            .context("Failed to bind netlink socket")?;

        Ok(Self {
            socket,
            seq: 0,
            batch: Vec::new(),
            timeout: DEFAULT_TIMEOUT,
        })
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    fn next_seq(&mut self) -> u32 {
        self.seq = self.seq.wrapping_add(1);
        self.seq
    }

    fn queue(&mut self, msg_type: u16, flags: u16, family: Family, attrs: Vec<u8>, what: String) {
        self.batch.push(Request {
            msg_type,
            flags,
            family: family.nfproto(),
            attrs,
            what,
        });
    }

    async fn send(&mut self, buf: &[u8]) -> Result<()> {
        let kernel = SocketAddr::new(0, 0);
        self.socket
            .send_to(buf, &kernel)
            .await
            .context("Failed to send netlink message")?;
        Ok(())
    }

    async fn recv(&mut self) -> Result<Vec<Message>> {
        let (buf, _addr) = tokio::time::timeout(self.timeout, self.socket.recv_from_full())
            .await
            .map_err(|_| NetlinkError::Timeout(self.timeout))?
            .context("Failed to receive netlink message")?;
        Ok(parse_messages(&buf)?)
    }

    /// Send a dump request and collect every reply up to NLMSG_DONE.
    async fn dump(&mut self, msg_type: u16, family: Family, attrs: &[u8]) -> Result<Vec<Message>> {
        let seq = self.next_seq();
        let request = nlmsg(
            nft_msg_type(msg_type),
            NLM_F_REQUEST | NLM_F_DUMP,
            seq,
            family.nfproto(),
            0,
            attrs,
        );
        self.send(&request).await?;

        let mut replies = Vec::new();
        loop {
            for msg in self.recv().await? {
                if msg.seq != seq {
                    continue;
                }
                match msg.msg_type {
                    NLMSG_DONE => return Ok(replies),
                    NLMSG_ERROR => {
                        ack_result(&msg.payload)?;
                        return Ok(replies);
                    }
                    _ => replies.push(msg),
                }
            }
        }
    }
}

impl NftConn for NetlinkConn {
    async fn list_tables(&mut self, family: Family) -> Result<Vec<LiveTable>> {
        let replies = self.dump(NFT_MSG_GETTABLE, family, &[]).await?;
        let mut tables = Vec::new();
        for msg in &replies {
            let table = parse_table(msg)?;
            if table.family == family {
                tables.push(table);
            }
        }
        Ok(tables)
    }

    fn add_table(&mut self, table: &LiveTable) {
        self.queue(
            NFT_MSG_NEWTABLE,
            NLM_F_CREATE,
            table.family,
            table_attrs(table),
            format!("create table '{}'", table.name),
        );
    }

    fn del_table(&mut self, table: &LiveTable) {
        self.queue(
            NFT_MSG_DELTABLE,
            0,
            table.family,
            table_attrs(table),
            format!("delete table '{}'", table.name),
        );
    }

    async fn list_chains(&mut self, family: Family) -> Result<Vec<LiveChain>> {
        let replies = self.dump(NFT_MSG_GETCHAIN, family, &[]).await?;
        let mut chains = Vec::new();
        for msg in &replies {
            match parse_chain(msg)? {
                Some(chain) if chain.family == family => chains.push(chain),
                _ => {}
            }
        }
        Ok(chains)
    }

    fn add_chain(&mut self, chain: &LiveChain) {
        self.queue(
            NFT_MSG_NEWCHAIN,
            NLM_F_CREATE,
            chain.family,
            chain_attrs(chain),
            format!("create chain '{}'", chain.name),
        );
    }

    fn del_chain(&mut self, chain: &LiveChain) {
        let mut attrs = Vec::new();
        push_attr_str(&mut attrs, NFTA_CHAIN_TABLE, &chain.table);
        push_attr_str(&mut attrs, NFTA_CHAIN_NAME, &chain.name);
        self.queue(
            NFT_MSG_DELCHAIN,
            0,
            chain.family,
            attrs,
            format!("delete chain '{}'", chain.name),
        );
    }

    async fn get_rules(&mut self, chain: &LiveChain) -> Result<Vec<LiveRule>> {
        let mut filter = Vec::new();
        push_attr_str(&mut filter, NFTA_RULE_TABLE, &chain.table);
        push_attr_str(&mut filter, NFTA_RULE_CHAIN, &chain.name);

        let replies = self.dump(NFT_MSG_GETRULE, chain.family, &filter).await?;
        let mut rules = Vec::new();
        for msg in &replies {
            let rule = parse_rule(msg)
                .with_context(|| format!("Failed to decode a rule of chain '{}'", chain.name))?;
            if rule.table == chain.table && rule.chain == chain.name {
                rules.push(rule);
            }
        }
        Ok(rules)
    }

    fn add_rule(&mut self, rule: &LiveRule) {
        self.queue(
            NFT_MSG_NEWRULE,
            NLM_F_CREATE | NLM_F_APPEND,
            rule.family,
            rule_attrs(rule),
            format!("add rule to chain '{}'", rule.chain),
        );
    }

    fn del_rule(&mut self, rule: &LiveRule) {
        let mut attrs = Vec::new();
        push_attr_str(&mut attrs, NFTA_RULE_TABLE, &rule.table);
        push_attr_str(&mut attrs, NFTA_RULE_CHAIN, &rule.chain);
        push_attr_u64(&mut attrs, NFTA_RULE_HANDLE, rule.handle);
        self.queue(
            NFT_MSG_DELRULE,
            0,
            rule.family,
            attrs,
            format!("delete rule #{} of chain '{}'", rule.handle, rule.chain),
        );
    }

    async fn get_sets(&mut self, table: &LiveTable) -> Result<Vec<LiveSet>> {
        let mut filter = Vec::new();
        push_attr_str(&mut filter, NFTA_SET_TABLE, &table.name);

        let replies = self.dump(NFT_MSG_GETSET, table.family, &filter).await?;
        let mut sets = Vec::new();
        for msg in &replies {
            match parse_set(msg)? {
                Some(set) if set.table == table.name => sets.push(set),
                _ => {}
            }
        }
        Ok(sets)
    }

    async fn get_set_elements(&mut self, set: &LiveSet) -> Result<Vec<LiveSetElement>> {
        let mut filter = Vec::new();
        push_attr_str(&mut filter, NFTA_SET_ELEM_LIST_TABLE, &set.table);
        push_attr_str(&mut filter, NFTA_SET_ELEM_LIST_SET, &set.name);

        let replies = self.dump(NFT_MSG_GETSETELEM, set.family, &filter).await?;
        let mut elements = Vec::new();
        for msg in &replies {
            elements.extend(parse_set_elements(msg)?);
        }
        Ok(elements)
    }

    fn add_set(&mut self, set: &LiveSet, elements: &[LiveSetElement]) {
        self.queue(
            NFT_MSG_NEWSET,
            NLM_F_CREATE,
            set.family,
            set_attrs(set),
            format!("create set '{}'", set.name),
        );
        if !elements.is_empty() {
            self.set_add_elements(set, elements);
        }
    }

    fn del_set(&mut self, set: &LiveSet) {
        let mut attrs = Vec::new();
        push_attr_str(&mut attrs, NFTA_SET_TABLE, &set.table);
        push_attr_str(&mut attrs, NFTA_SET_NAME, &set.name);
        self.queue(
            NFT_MSG_DELSET,
            0,
            set.family,
            attrs,
            format!("delete set '{}'", set.name),
        );
    }

    fn set_add_elements(&mut self, set: &LiveSet, elements: &[LiveSetElement]) {
        self.queue(
            NFT_MSG_NEWSETELEM,
            NLM_F_CREATE,
            set.family,
            elements_attrs(set, elements),
            format!("add {} element(s) to set '{}'", elements.len(), set.name),
        );
    }

    fn set_delete_elements(&mut self, set: &LiveSet, elements: &[LiveSetElement]) {
        self.queue(
            NFT_MSG_DELSETELEM,
            0,
            set.family,
            elements_attrs(set, elements),
            format!("delete {} element(s) from set '{}'", elements.len(), set.name),
        );
    }

    /// Send the queued messages as one transaction and wait for every ack.
    async fn flush(&mut self) -> Result<()> {
        if self.batch.is_empty() {
            return Ok(());
        }

        let requests = std::mem::take(&mut self.batch);
        let begin = self.next_seq();
        self.seq = self.seq.wrapping_add(requests.len() as u32 + 1);
        let (buf, mut pending) = encode_batch(begin, &requests);
        debug!(messages = requests.len(), bytes = buf.len(), "Sending batch");
        self.send(&buf).await?;

        let mut failure: Option<anyhow::Error> = None;
        while !pending.is_empty() {
            let replies = match self.recv().await {
                Ok(replies) => replies,
                // An aborted batch need not answer every message
                Err(_) if failure.is_some() => break,
                Err(err) => return Err(err),
            };

            for msg in replies {
                if msg.msg_type != NLMSG_ERROR {
                    continue;
                }
                if msg.seq == begin {
                    ack_result(&msg.payload).context("Kernel rejected the batch")?;
                    continue;
                }
                let Some(what) = pending.remove(&msg.seq) else {
                    continue;
                };
                if let Err(err) = ack_result(&msg.payload) {
                    warn!(error = %err, "Failed to {}", what);
                    if failure.is_none() {
                        failure = Some(anyhow::Error::new(err).context(format!("Failed to {}", what)));
                    }
                }
            }
        }

        match failure {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

fn nft_msg_type(msg: u16) -> u16 {
    (NFNL_SUBSYS_NFTABLES << 8) | msg
}

/// nlmsghdr, nfgenmsg, then the attributes
fn nlmsg(msg_type: u16, flags: u16, seq: u32, family: u8, res_id: u16, attrs: &[u8]) -> Vec<u8> {
    let len = NLMSG_HDRLEN + NFGENMSG_LEN + attrs.len();
    let mut buf = Vec::with_capacity(nla_align(len));
    buf.extend_from_slice(&(len as u32).to_ne_bytes());
    buf.extend_from_slice(&msg_type.to_ne_bytes());
    buf.extend_from_slice(&flags.to_ne_bytes());
    buf.extend_from_slice(&seq.to_ne_bytes());
    buf.extend_from_slice(&0u32.to_ne_bytes());
    buf.push(family);
    buf.push(NFNETLINK_V0);
    buf.extend_from_slice(&res_id.to_be_bytes());
    buf.extend_from_slice(attrs);
    buf.resize(nla_align(len), 0);
    buf
}

/// Frame `requests` between batch begin and end markers. Sequence numbers run
/// from `begin`; returns the buffer and the description of each acked sequence.
fn encode_batch(begin: u32, requests: &[Request]) -> (Vec<u8>, HashMap<u32, String>) {
    let mut buf = nlmsg(
        NFNL_MSG_BATCH_BEGIN,
        NLM_F_REQUEST,
        begin,
        AF_UNSPEC,
        NFNL_SUBSYS_NFTABLES,
        &[],
    );
    let mut pending = HashMap::with_capacity(requests.len());

    let mut seq = begin;
    for request in requests {
        seq = seq.wrapping_add(1);
        buf.extend(nlmsg(
            nft_msg_type(request.msg_type),
            NLM_F_REQUEST | NLM_F_ACK | request.flags,
            seq,
            request.family,
            0,
            &request.attrs,
        ));
        pending.insert(seq, request.what.clone());
    }

    buf.extend(nlmsg(
        NFNL_MSG_BATCH_END,
        NLM_F_REQUEST,
        seq.wrapping_add(1),
        AF_UNSPEC,
        NFNL_SUBSYS_NFTABLES,
        &[],
    ));
    (buf, pending)
}

fn parse_messages(buf: &[u8]) -> Result<Vec<Message>, DecodeError> {
    let mut messages = Vec::new();
    let mut offset = 0usize;

    while offset + NLMSG_HDRLEN <= buf.len() {
        let header = &buf[offset..offset + NLMSG_HDRLEN];
        let len = u32::from_ne_bytes([header[0], header[1], header[2], header[3]]) as usize;
        if len < NLMSG_HDRLEN || offset + len > buf.len() {
            return Err(DecodeError::Truncated("netlink message"));
        }
        messages.push(Message {
            msg_type: u16::from_ne_bytes([header[4], header[5]]),
            seq: u32::from_ne_bytes([header[8], header[9], header[10], header[11]]),
            payload: buf[offset + NLMSG_HDRLEN..offset + len].to_vec(),
        });
        offset += nla_align(len);
    }

    Ok(messages)
}

/// Outcome carried by an NLMSG_ERROR payload; zero is an ack.
fn ack_result(payload: &[u8]) -> Result<(), NetlinkError> {
    let code = payload
        .get(..4)
        .and_then(|b| <[u8; 4]>::try_from(b).ok())
        .map(i32::from_ne_bytes)
        .ok_or(DecodeError::Truncated("error message"))?;

    if code == 0 {
        Ok(())
    } else {
        Err(NetlinkError::Kernel(io::Error::from_raw_os_error(-code)))
    }
}

fn table_attrs(table: &LiveTable) -> Vec<u8> {
    let mut attrs = Vec::new();
    push_attr_str(&mut attrs, NFTA_TABLE_NAME, &table.name);
    attrs
}

fn chain_attrs(chain: &LiveChain) -> Vec<u8> {
    let mut attrs = Vec::new();
    push_attr_str(&mut attrs, NFTA_CHAIN_TABLE, &chain.table);
    push_attr_str(&mut attrs, NFTA_CHAIN_NAME, &chain.name);
    push_attr_nested(&mut attrs, NFTA_CHAIN_HOOK, |hook| {
        push_attr_u32(hook, NFTA_HOOK_HOOKNUM, chain.hooknum());
        push_attr_u32(hook, NFTA_HOOK_PRIORITY, chain.priority as u32);
    });
    push_attr_u32(&mut attrs, NFTA_CHAIN_POLICY, chain.policy.verdict());
    push_attr_str(&mut attrs, NFTA_CHAIN_TYPE, chain.chain_type.as_str());
    attrs
}

fn rule_attrs(rule: &LiveRule) -> Vec<u8> {
    let mut attrs = Vec::new();
    push_attr_str(&mut attrs, NFTA_RULE_TABLE, &rule.table);
    push_attr_str(&mut attrs, NFTA_RULE_CHAIN, &rule.chain);
    push_attr_nested(&mut attrs, NFTA_RULE_EXPRESSIONS, |list| {
        for expr in &rule.exprs {
            list.extend(expr.marshal());
        }
    });
    if !rule.userdata.is_empty() {
        push_attr_bytes(&mut attrs, NFTA_RULE_USERDATA, &rule.userdata);
    }
    attrs
}

fn set_attrs(set: &LiveSet) -> Vec<u8> {
    let mut attrs = Vec::new();
    push_attr_str(&mut attrs, NFTA_SET_TABLE, &set.table);
    push_attr_str(&mut attrs, NFTA_SET_NAME, &set.name);
    push_attr_u32(
        &mut attrs,
        NFTA_SET_FLAGS,
        if set.is_map() { NFT_SET_MAP } else { 0 },
    );
    push_attr_u32(&mut attrs, NFTA_SET_KEY_TYPE, set.key_type.type_id());
    push_attr_u32(&mut attrs, NFTA_SET_KEY_LEN, set.key_type.len());
    if let Some(data_type) = set.data_type {
        push_attr_u32(&mut attrs, NFTA_SET_DATA_TYPE, data_type.type_id());
        push_attr_u32(&mut attrs, NFTA_SET_DATA_LEN, data_type.len());
    }
    attrs
}

fn elements_attrs(set: &LiveSet, elements: &[LiveSetElement]) -> Vec<u8> {
    let mut attrs = Vec::new();
    push_attr_str(&mut attrs, NFTA_SET_ELEM_LIST_TABLE, &set.table);
    push_attr_str(&mut attrs, NFTA_SET_ELEM_LIST_SET, &set.name);
    push_attr_nested(&mut attrs, NFTA_SET_ELEM_LIST_ELEMENTS, |list| {
        for element in elements {
            push_attr_nested(list, NFTA_LIST_ELEM, |elem| {
                push_attr_nested(elem, NFTA_SET_ELEM_KEY, |key| {
                    push_attr_bytes(key, NFTA_DATA_VALUE, &element.key);
                });
                if let Some(data) = &element.data {
                    push_attr_nested(elem, NFTA_SET_ELEM_DATA, |value| {
                        push_attr_bytes(value, NFTA_DATA_VALUE, data);
                    });
                }
            });
        }
    });
    attrs
}

fn parse_table(msg: &Message) -> Result<LiveTable, DecodeError> {
    let (family, attrs) = msg.nft_body()?;
    Ok(LiveTable {
        family,
        name: attrs.string(NFTA_TABLE_NAME, "table name")?,
    })
}

/// `None` for regular chains and base chains this model cannot express
fn parse_chain(msg: &Message) -> Result<Option<LiveChain>, DecodeError> {
    let (family, attrs) = msg.nft_body()?;
    let table = attrs.string(NFTA_CHAIN_TABLE, "chain table")?;
    let name = attrs.string(NFTA_CHAIN_NAME, "chain name")?;

    if !attrs.has(NFTA_CHAIN_HOOK) {
        debug!(table = %table, chain = %name, "Ignoring regular chain");
        return Ok(None);
    }
    let hook = attrs.nested(NFTA_CHAIN_HOOK, "chain hook")?;
    let hooknum = hook.u32(NFTA_HOOK_HOOKNUM, "hook number")?;
    let priority = hook.u32(NFTA_HOOK_PRIORITY, "hook priority")? as i32;
    let chain_type = attrs.string(NFTA_CHAIN_TYPE, "chain type")?;
    let policy = attrs.u32(NFTA_CHAIN_POLICY, "chain policy")?;

    let (Some(hook), Some(chain_type), Some(policy)) = (
        ChainHook::from_hooknum(family, hooknum),
        ChainType::parse(&chain_type),
        ChainPolicy::from_verdict(policy),
    ) else {
        warn!(table = %table, chain = %name, hooknum, chain_type = %chain_type, policy, "Ignoring chain with unsupported settings");
        return Ok(None);
    };

    Ok(Some(LiveChain {
        family,
        table,
        name,
        chain_type,
        hook,
        priority,
        policy,
    }))
}

fn parse_rule(msg: &Message) -> Result<LiveRule, DecodeError> {
    let (family, attrs) = msg.nft_body()?;
    let exprs = match attrs.get(NFTA_RULE_EXPRESSIONS) {
        Some(list) => Expr::decode_list(list)?,
        None => Vec::new(),
    };

    Ok(LiveRule {
        family,
        table: attrs.string(NFTA_RULE_TABLE, "rule table")?,
        chain: attrs.string(NFTA_RULE_CHAIN, "rule chain")?,
        handle: attrs.u64(NFTA_RULE_HANDLE, "rule handle")?,
        exprs,
        userdata: attrs
            .get(NFTA_RULE_USERDATA)
            .map(<[u8]>::to_vec)
            .unwrap_or_default(),
    })
}

/// `None` for anonymous sets and for key or data types this model cannot express
fn parse_set(msg: &Message) -> Result<Option<LiveSet>, DecodeError> {
    let (family, attrs) = msg.nft_body()?;
    let table = attrs.string(NFTA_SET_TABLE, "set table")?;
    let name = attrs.string(NFTA_SET_NAME, "set name")?;
    let flags = attrs.opt_u32(NFTA_SET_FLAGS, "set flags")?.unwrap_or(0);
    if flags & NFT_SET_ANONYMOUS != 0 {
        return Ok(None);
    }

    let key_type = attrs.u32(NFTA_SET_KEY_TYPE, "set key type")?;
    let data_type = attrs.opt_u32(NFTA_SET_DATA_TYPE, "set data type")?;
    let Some(key_type) = SetDataType::from_type_id(key_type) else {
        warn!(table = %table, set = %name, key_type, "Ignoring set with unsupported key type");
        return Ok(None);
    };
    let data_type = match data_type {
        None => None,
        Some(id) => match SetDataType::from_type_id(id) {
            Some(data_type) => Some(data_type),
            None => {
                warn!(table = %table, set = %name, data_type = id, "Ignoring map with unsupported data type");
                return Ok(None);
            }
        },
    };

    Ok(Some(LiveSet {
        family,
        table,
        name,
        key_type,
        data_type,
    }))
}

fn parse_set_elements(msg: &Message) -> Result<Vec<LiveSetElement>, DecodeError> {
    let (_, attrs) = msg.nft_body()?;
    let Some(list) = attrs.get(NFTA_SET_ELEM_LIST_ELEMENTS) else {
        return Ok(Vec::new());
    };

    Attrs::parse(list)?
        .iter()
        .filter(|(attr_type, _)| *attr_type == NFTA_LIST_ELEM)
        .map(|(_, elem)| -> Result<LiveSetElement, DecodeError> {
            let elem = Attrs::parse(elem)?;
            let key = elem
                .nested(NFTA_SET_ELEM_KEY, "element key")?
                .bytes(NFTA_DATA_VALUE, "element key")?
                .to_vec();
            let data = match elem.get(NFTA_SET_ELEM_DATA) {
                Some(data) => Some(
                    Attrs::parse(data)?
                        .bytes(NFTA_DATA_VALUE, "element data")?
                        .to_vec(),
                ),
                None => None,
            };
            Ok(LiveSetElement { key, data })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::expr::{CmpOp, NFT_REG_1, Verdict};
    use crate::identity::rule_comment;

    fn reply(msg_type: u16, family: Family, attrs: &[u8]) -> Message {
        let buf = nlmsg(nft_msg_type(msg_type), 0, 7, family.nfproto(), 0, attrs);
        parse_messages(&buf).unwrap().remove(0)
    }

    fn input_chain() -> LiveChain {
        LiveChain {
            family: Family::Inet,
            table: "edge".into(),
            name: "input".into(),
            chain_type: ChainType::Filter,
            hook: ChainHook::Input,
            priority: -150,
            policy: ChainPolicy::Drop,
        }
    }

    fn request(msg_type: u16, what: &str) -> Request {
        Request {
            msg_type,
            flags: NLM_F_CREATE,
            family: Family::Inet.nfproto(),
            attrs: Vec::new(),
            what: what.into(),
        }
    }

    #[test]
    fn batch_is_framed_by_begin_and_end() {
        let requests = vec![
            request(NFT_MSG_NEWTABLE, "create table"),
            request(NFT_MSG_NEWCHAIN, "create chain"),
        ];
        let (buf, pending) = encode_batch(40, &requests);
        let messages = parse_messages(&buf).unwrap();

        let types: Vec<u16> = messages.iter().map(|m| m.msg_type).collect();
        assert_eq!(
            types,
            vec![
                NFNL_MSG_BATCH_BEGIN,
                nft_msg_type(NFT_MSG_NEWTABLE),
                nft_msg_type(NFT_MSG_NEWCHAIN),
                NFNL_MSG_BATCH_END
            ]
        );
        let seqs: Vec<u32> = messages.iter().map(|m| m.seq).collect();
        assert_eq!(seqs, vec![40, 41, 42, 43]);

        // Batch markers address the nf_tables subsystem through res_id
        assert_eq!(&messages[0].payload[..4], &[AF_UNSPEC, 0, 0, 10]);
        assert_eq!(messages[1].payload[0], Family::Inet.nfproto());

        assert_eq!(pending.len(), 2);
        assert_eq!(pending[&42], "create chain");
    }

    #[test]
    fn inner_messages_request_acks() {
        let (buf, _) = encode_batch(1, &[request(NFT_MSG_NEWRULE, "add rule")]);
        let flags_of = |offset: usize| u16::from_ne_bytes([buf[offset + 6], buf[offset + 7]]);

        let begin_len = NLMSG_HDRLEN + NFGENMSG_LEN;
        assert_eq!(flags_of(0), NLM_F_REQUEST);
        assert_eq!(flags_of(begin_len), NLM_F_REQUEST | NLM_F_ACK | NLM_F_CREATE);
    }

    #[test]
    fn error_payload_carries_negative_errno() {
        assert!(ack_result(&0i32.to_ne_bytes()).is_ok());

        let err = ack_result(&(-16i32).to_ne_bytes()).unwrap_err();
        assert_eq!(err.errno(), Some(16));

        assert!(matches!(
            ack_result(&[0, 0]),
            Err(NetlinkError::Decode(DecodeError::Truncated(_)))
        ));
    }

    #[test]
    fn truncated_message_is_rejected() {
        let mut buf = nlmsg(NLMSG_DONE, 0, 1, 0, 0, &[]);
        buf.truncate(NLMSG_HDRLEN + 1);
        buf[0] = 64;
        assert!(parse_messages(&buf).is_err());
    }

    #[test]
    fn chain_reads_back_with_negative_priority() {
        let chain = input_chain();
        let msg = reply(NFT_MSG_NEWCHAIN, Family::Inet, &chain_attrs(&chain));
        assert_eq!(parse_chain(&msg).unwrap(), Some(chain));
    }

    #[test]
    fn regular_and_unknown_chains_are_skipped() {
        let mut attrs = Vec::new();
        push_attr_str(&mut attrs, NFTA_CHAIN_TABLE, "edge");
        push_attr_str(&mut attrs, NFTA_CHAIN_NAME, "helpers");
        let msg = reply(NFT_MSG_NEWCHAIN, Family::Inet, &attrs);
        assert_eq!(parse_chain(&msg).unwrap(), None);

        let mut attrs = Vec::new();
        push_attr_str(&mut attrs, NFTA_CHAIN_TABLE, "edge");
        push_attr_str(&mut attrs, NFTA_CHAIN_NAME, "in");
        push_attr_nested(&mut attrs, NFTA_CHAIN_HOOK, |hook| {
            push_attr_u32(hook, NFTA_HOOK_HOOKNUM, 1);
            push_attr_u32(hook, NFTA_HOOK_PRIORITY, 0);
        });
        push_attr_u32(&mut attrs, NFTA_CHAIN_POLICY, 1);
        push_attr_str(&mut attrs, NFTA_CHAIN_TYPE, "offload");
        let msg = reply(NFT_MSG_NEWCHAIN, Family::Inet, &attrs);
        assert_eq!(parse_chain(&msg).unwrap(), None);
    }

    #[test]
    fn rule_reads_back_with_handle_and_name() {
        let rule = LiveRule {
            family: Family::Ipv4,
            table: "edge".into(),
            chain: "input".into(),
            handle: 0,
            exprs: vec![
                Expr::cmp(CmpOp::Eq, vec![6]),
                Expr::verdict(Verdict::Accept),
            ],
            userdata: rule_comment("ssh").unwrap(),
        };
        let mut attrs = rule_attrs(&rule);
        push_attr_u64(&mut attrs, NFTA_RULE_HANDLE, 12);

        let live = parse_rule(&reply(NFT_MSG_NEWRULE, Family::Ipv4, &attrs)).unwrap();
        assert_eq!(live.handle, 12);
        assert_eq!(live.exprs, rule.exprs);
        assert_eq!(live.userdata, rule.userdata);
        assert_eq!(live.family, Family::Ipv4);
        assert!(matches!(&live.exprs[0], Expr::Cmp { sreg: NFT_REG_1, .. }));
    }

    #[test]
    fn sets_and_maps_read_back() {
        let set = LiveSet {
            family: Family::Inet,
            table: "edge".into(),
            name: "trusted".into(),
            key_type: SetDataType::Ipv4Addr,
            data_type: None,
        };
        let msg = reply(NFT_MSG_NEWSET, Family::Inet, &set_attrs(&set));
        assert_eq!(parse_set(&msg).unwrap(), Some(set.clone()));

        let map = LiveSet {
            data_type: Some(SetDataType::Ipv4Addr),
            ..set.clone()
        };
        let msg = reply(NFT_MSG_NEWSET, Family::Inet, &set_attrs(&map));
        assert_eq!(parse_set(&msg).unwrap(), Some(map));

        let mut anonymous = Vec::new();
        push_attr_str(&mut anonymous, NFTA_SET_TABLE, "edge");
        push_attr_str(&mut anonymous, NFTA_SET_NAME, "__set0");
        push_attr_u32(&mut anonymous, NFTA_SET_FLAGS, NFT_SET_ANONYMOUS);
        push_attr_u32(&mut anonymous, NFTA_SET_KEY_TYPE, 7);
        let msg = reply(NFT_MSG_NEWSET, Family::Inet, &anonymous);
        assert_eq!(parse_set(&msg).unwrap(), None);
    }

    #[test]
    fn set_elements_read_back() {
        let set = LiveSet {
            family: Family::Inet,
            table: "edge".into(),
            name: "gateways".into(),
            key_type: SetDataType::Ipv4Addr,
            data_type: Some(SetDataType::Ipv4Addr),
        };
        let elements = vec![
            LiveSetElement {
                key: vec![10, 0, 0, 1],
                data: Some(vec![192, 168, 0, 1]),
            },
            LiveSetElement {
                key: vec![10, 0, 0, 2],
                data: None,
            },
        ];
        let msg = reply(NFT_MSG_NEWSETELEM, Family::Inet, &elements_attrs(&set, &elements));
        assert_eq!(parse_set_elements(&msg).unwrap(), elements);
    }

    #[test]
    fn table_reads_back() {
        let table = LiveTable {
            family: Family::Ipv6,
            name: "edge6".into(),
        };
        let msg = reply(NFT_MSG_NEWTABLE, Family::Ipv6, &table_attrs(&table));
        assert_eq!(parse_table(&msg).unwrap(), table);
    }
}
