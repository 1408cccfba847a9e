use fw_core::{
    Admission, AdmissionDecision, Chain, ChainHook, ChainPolicy, ChainType, Family, FilterAction,
    FilterRule, IpPosition, L4Proto, Match, MatchOp, NatRule, NatType, PortPosition, RuleRef, RulesSet, Set,
    SetDataType, SetElement, Table, TableValidator,
};
use fw_nft::{
    ByteorderOp, Change, CompileContext, Expr, KernelState, LiveSetElement, MemoryConn,
    NFT_REG_1, PartialReconcile, Reconciler, compile_rule, rule_comment, rule_equal, rule_name,
};

const SPEC: &str = r#"
name: edge
family: INET
sets:
  - name: trusted
    keyType: ipv4_addr
    elements:
      - key: 10.0.0.1
      - key: 10.0.0.2
chains:
  - name: input
    type: filter
    hook: input
    policy: drop
    rules:
      filterRules:
        - name: ssh
          match:
            - op: eq
              proto: { value: tcp }
            - op: eq
              port: { value: "22", position: dst }
          action: accept
        - name: trusted-hosts
          match:
            - op: eq
              ip: { value: "@trusted", position: src }
          action: accept
        - name: web-range
          match:
            - op: eq
              proto: { value: tcp }
            - op: eq
              port: { value: "3000-4000", position: dst }
          action: accept
        - name: clamp
          match:
            - op: eq
              proto: { value: tcp }
          action: tcpmssclamp
          value: "1360"
  - name: postrouting
    type: nat
    hook: postrouting
    priority: 100
    rules:
      natRules:
        - name: masq-uplink
          match:
            - op: eq
              dev: { value: eth0, position: out }
          natType: masquerade
        - name: snat-lan
          match:
            - op: eq
              ip: { value: 192.168.10.0/24, position: src }
          natType: snat
          to: 203.0.113.0/29
"#;

fn edge_table() -> Table {
    Table::from_yaml(SPEC).unwrap()
}

fn admitted(table: Table) -> Table {
    match Admission::new(&[]).review_create(table) {
        AdmissionDecision::Allowed { table, .. } => table,
        AdmissionDecision::Denied(errors) => panic!("specification denied: {}", errors),
    }
}

fn set_keys(conn: &MemoryConn, table: &str, set: &str) -> Vec<Vec<u8>> {
    let mut keys: Vec<Vec<u8>> = conn
        .state()
        .set(Family::Inet, table, set)
        .unwrap()
        .elements
        .iter()
        .map(|e| e.key.clone())
        .collect();
    keys.sort();
    keys
}

#[tokio::test]
async fn second_pass_is_a_noop() {
    let table = admitted(edge_table());
    let mut conn = MemoryConn::new();

    let first = Reconciler::new(&mut conn).reconcile(&table).await.unwrap();
    assert_eq!(first.rules_added, 6);
    assert_eq!(first.chains_created, 2);
    assert_eq!(first.sets_created, 1);
    conn.take_journal();

    let second = Reconciler::new(&mut conn).reconcile(&table).await.unwrap();
    assert!(second.is_noop(), "unexpected mutations: {:?}", second);
    assert!(conn.journal().is_empty());
}

#[tokio::test]
async fn every_added_rule_compares_equal_to_its_declaration() {
    let table = admitted(edge_table());
    let mut conn = MemoryConn::new();
    Reconciler::new(&mut conn).reconcile(&table).await.unwrap();

    for live in &conn.state().rules {
        let name = rule_name(&live.userdata).unwrap();
        let chain = table.chain(&live.chain).unwrap();
        let rules = chain.rules.rules();
        let wanted = rules.iter().find(|r| r.name() == Some(name.as_str())).unwrap();
        assert!(rule_equal(live, *wanted).unwrap(), "rule {} differs", name);
    }
}

#[tokio::test]
async fn converges_from_foreign_state() {
    let table = admitted(edge_table());
    let mut conn = MemoryConn::new();
    Reconciler::new(&mut conn).reconcile(&table).await.unwrap();

    // Another writer adds an unnamed rule, a rule with an unknown name and a duplicate
    let ssh = conn
        .state()
        .rules
        .iter()
        .find(|r| rule_name(&r.userdata).as_deref() == Some("ssh"))
        .cloned()
        .unwrap();
    let mut unnamed = ssh.clone();
    unnamed.userdata.clear();
    let mut unknown = ssh.clone();
    unknown.userdata = rule_comment("legacy").unwrap();
    conn.insert_rule(unnamed);
    conn.insert_rule(unknown);
    conn.insert_rule(ssh);

    let report = Reconciler::new(&mut conn).reconcile(&table).await.unwrap();
    assert_eq!(report.rules_deleted, 3);
    assert_eq!(report.rules_added, 0);

    let mut names: Vec<String> = conn
        .state()
        .rules
        .iter()
        .filter_map(|r| rule_name(&r.userdata))
        .collect();
    names.sort();
    assert_eq!(
        names,
        vec!["clamp", "masq-uplink", "snat-lan", "ssh", "trusted-hosts", "web-range"]
    );
}

#[tokio::test]
async fn extraneous_chains_and_sets_are_removed() {
    let table = admitted(edge_table());
    let mut conn = MemoryConn::new();
    Reconciler::new(&mut conn).reconcile(&table).await.unwrap();

    let mut extended = table.clone();
    extended
        .chains
        .push(Chain::new("forward", ChainType::Filter, ChainHook::Forward));
    extended.sets.push(Set {
        name: "stale".into(),
        key_type: SetDataType::Ipv4Addr,
        data_type: None,
        elements: vec![],
    });
    Reconciler::new(&mut conn).reconcile(&extended).await.unwrap();
    assert_eq!(conn.state().chains.len(), 3);

    let report = Reconciler::new(&mut conn).reconcile(&table).await.unwrap();
    assert_eq!(report.chains_deleted, 1);
    assert_eq!(report.sets_deleted, 1);
    assert_eq!(conn.state().chains.len(), 2);
    assert_eq!(conn.state().sets.len(), 1);
}

#[tokio::test]
async fn tables_are_isolated() {
    let table = admitted(edge_table());
    let mut other = admitted(edge_table());
    other.name = "other".into();

    let mut conn = MemoryConn::new();
    Reconciler::new(&mut conn).reconcile(&table).await.unwrap();
    Reconciler::new(&mut conn).reconcile(&other).await.unwrap();

    let report = Reconciler::new(&mut conn).reconcile(&table).await.unwrap();
    assert!(report.is_noop());
    assert_eq!(conn.state().tables.len(), 2);
    assert_eq!(conn.state().chains.len(), 4);
}

#[tokio::test]
async fn priority_change_recreates_chain() {
    let table = admitted(edge_table());
    let mut conn = MemoryConn::new();
    Reconciler::new(&mut conn).reconcile(&table).await.unwrap();
    conn.take_journal();

    let mut changed = table.clone();
    changed.chains[0].priority = 100;
    let report = Reconciler::new(&mut conn).reconcile(&changed).await.unwrap();

    assert_eq!(report.chains_deleted, 1);
    assert_eq!(report.chains_created, 1);
    assert_eq!(report.rules_added, 4);
    let journal = conn.journal();
    assert!(matches!(&journal[0], Change::ChainDeleted { chain, .. } if chain == "input"));
    assert!(
        journal
            .iter()
            .any(|c| matches!(c, Change::ChainAdded { chain, .. } if chain == "input"))
    );
    let input = conn.state().chain(Family::Inet, "edge", "input").unwrap();
    assert_eq!(input.priority, 100);
}

#[tokio::test]
async fn policy_change_updates_in_place() {
    let table = admitted(edge_table());
    let mut conn = MemoryConn::new();
    Reconciler::new(&mut conn).reconcile(&table).await.unwrap();
    let handles: Vec<u64> = conn.state().rules.iter().map(|r| r.handle).collect();
    conn.take_journal();

    let mut changed = table.clone();
    changed.chains[0].policy = Some(ChainPolicy::Accept);
    let report = Reconciler::new(&mut conn).reconcile(&changed).await.unwrap();

    assert_eq!(report.chains_deleted, 0);
    assert_eq!(report.chains_updated, 1);
    assert_eq!(report.rules_added, 0);
    assert!(matches!(
        conn.journal(),
        [Change::ChainUpdated {
            policy: ChainPolicy::Accept,
            ..
        }]
    ));
    let after: Vec<u64> = conn.state().rules.iter().map(|r| r.handle).collect();
    assert_eq!(handles, after);
}

#[tokio::test]
async fn set_update_replaces_all_elements() {
    let table = admitted(edge_table());
    let mut conn = MemoryConn::new();
    Reconciler::new(&mut conn).reconcile(&table).await.unwrap();
    conn.take_journal();

    let mut changed = table.clone();
    changed.sets[0].elements = vec![
        SetElement {
            key: "10.0.0.2".into(),
            data: None,
        },
        SetElement {
            key: "10.0.0.3".into(),
            data: None,
        },
    ];
    let report = Reconciler::new(&mut conn).reconcile(&changed).await.unwrap();
    assert_eq!(report.sets_updated, 1);

    assert_eq!(
        set_keys(&conn, "edge", "trusted"),
        vec![vec![10, 0, 0, 2], vec![10, 0, 0, 3]]
    );
    assert!(
        conn.journal()
            .iter()
            .any(|c| matches!(c, Change::ElementsDeleted { count: 2, .. }))
    );
    assert!(
        conn.journal()
            .iter()
            .any(|c| matches!(c, Change::ElementsAdded { count: 2, .. }))
    );
}

#[tokio::test]
async fn set_retyped_under_a_referencing_rule_is_recreated() {
    let table = admitted(edge_table());
    let mut conn = MemoryConn::new();
    Reconciler::new(&mut conn).reconcile(&table).await.unwrap();
    conn.take_journal();

    let mut retyped = table.clone();
    retyped.sets[0].data_type = Some(SetDataType::Ipv4Addr);
    retyped.sets[0].elements = vec![SetElement {
        key: "10.0.0.1".into(),
        data: Some("192.168.0.1".into()),
    }];
    let retyped = admitted(retyped);

    let report = Reconciler::new(&mut conn).reconcile(&retyped).await.unwrap();
    assert_eq!(report.sets_deleted, 1);
    assert_eq!(report.sets_created, 1);
    assert_eq!(report.rules_deleted, 1);
    assert_eq!(report.rules_added, 1);

    let set = conn.state().set(Family::Inet, "edge", "trusted").unwrap();
    assert_eq!(set.elements.len(), 1);
    assert_eq!(set.elements[0].data, Some(vec![192, 168, 0, 1]));
    assert!(
        conn.state()
            .rules
            .iter()
            .any(|r| rule_name(&r.userdata).as_deref() == Some("trusted-hosts"))
    );

    conn.take_journal();
    let again = Reconciler::new(&mut conn).reconcile(&retyped).await.unwrap();
    assert!(again.is_noop(), "unexpected mutations: {:?}", again);
}

#[tokio::test]
async fn uncompilable_rule_does_not_block_stale_rule_removal() {
    let mut table = Table::new("edge4", Family::Ipv4);
    let mut chain = Chain::new("input", ChainType::Filter, ChainHook::Input);
    chain.rules = RulesSet::filter(vec![FilterRule {
        name: Some("old".into()),
        matches: vec![Match::proto(MatchOp::Eq, L4Proto::Udp)],
        action: FilterAction::Drop,
        value: None,
    }]);
    table.chains.push(chain);

    let mut conn = MemoryConn::new();
    Reconciler::new(&mut conn).reconcile(&table).await.unwrap();

    // Skips admission, which would refuse the v6 address outright
    table.chains[0].rules = RulesSet::filter(vec![
        FilterRule {
            name: Some("v6".into()),
            matches: vec![Match::ip(MatchOp::Eq, "fd00::1", IpPosition::Src)],
            action: FilterAction::Accept,
            value: None,
        },
        FilterRule {
            name: Some("web".into()),
            matches: vec![
                Match::proto(MatchOp::Eq, L4Proto::Tcp),
                Match::port(MatchOp::Eq, "443", PortPosition::Dst),
            ],
            action: FilterAction::Accept,
            value: None,
        },
    ]);

    let err = Reconciler::new(&mut conn).reconcile(&table).await.unwrap_err();
    let partial = err.downcast_ref::<PartialReconcile>().unwrap();
    assert_eq!(partial.failures.len(), 1);
    assert_eq!(partial.failures[0].rule, "v6");
    assert_eq!(partial.report.rules_deleted, 1);
    assert_eq!(partial.report.rules_added, 1);

    let names: Vec<String> = conn
        .state()
        .rules
        .iter()
        .filter_map(|r| rule_name(&r.userdata))
        .collect();
    assert_eq!(names, vec!["web".to_string()]);
}

#[tokio::test]
async fn counters_and_byteorder_do_not_cause_churn() {
    let table = admitted(edge_table());
    let mut conn = MemoryConn::new();
    Reconciler::new(&mut conn).reconcile(&table).await.unwrap();

    // Simulate the kernel echoing extra instructions back on read
    let mut state: KernelState = conn.state().clone();
    for rule in &mut state.rules {
        rule.exprs.push(Expr::Counter {
            bytes: 1024,
            packets: 3,
        });
        rule.exprs.insert(
            0,
            Expr::Byteorder {
                sreg: NFT_REG_1,
                dreg: NFT_REG_1,
                op: ByteorderOp::Hton,
                len: 2,
                size: 2,
            },
        );
    }
    let mut conn = MemoryConn::from_state(state);

    let report = Reconciler::new(&mut conn).reconcile(&table).await.unwrap();
    assert!(report.is_noop(), "unexpected mutations: {:?}", report);
}

#[tokio::test]
async fn ctmark_rules_are_not_churned() {
    let mut chain = Chain::new("mark", ChainType::Filter, ChainHook::Prerouting);
    chain.rules = RulesSet::filter(vec![FilterRule {
        name: Some("mark-vpn".into()),
        matches: vec![],
        action: FilterAction::CtMark,
        value: Some("0x2".into()),
    }]);
    let mut table = Table::new("marks", Family::Inet);
    table.chains.push(chain);

    let mut conn = MemoryConn::new();
    Reconciler::new(&mut conn).reconcile(&table).await.unwrap();

    // The kernel reads the mark write back in a different shape
    let mut state = conn.state().clone();
    state.rules[0].exprs = vec![Expr::Ct {
        key: fw_nft::CtKey::Mark,
        dreg: NFT_REG_1,
    }];
    let mut conn = MemoryConn::from_state(state);

    let report = Reconciler::new(&mut conn).reconcile(&table).await.unwrap();
    assert!(report.is_noop());
}

#[tokio::test]
async fn interrupted_pass_converges_on_retry() {
    let table = admitted(edge_table());
    let mut changed = table.clone();
    changed.chains[0].priority = 10;

    let mut conn = MemoryConn::new();
    Reconciler::new(&mut conn).reconcile(&table).await.unwrap();

    conn.fail_next_flush("ENOBUFS");
    assert!(Reconciler::new(&mut conn).reconcile(&changed).await.is_err());
    let input = conn.state().chain(Family::Inet, "edge", "input").unwrap();
    assert_eq!(input.priority, 0);

    // State left behind when only the deletion batch committed
    let mut partial = conn.state().clone();
    partial.chains.retain(|c| c.name != "input");
    partial.rules.retain(|r| r.chain != "input");
    let mut conn = MemoryConn::from_state(partial);

    let report = Reconciler::new(&mut conn).reconcile(&changed).await.unwrap();
    assert_eq!(report.chains_created, 1);
    assert_eq!(report.rules_added, 4);

    let again = Reconciler::new(&mut conn).reconcile(&changed).await.unwrap();
    assert!(again.is_noop());
}

#[test]
fn port_range_compiles_to_two_comparisons() {
    let rule = FilterRule {
        name: Some("range".into()),
        matches: vec![Match::port(MatchOp::Neq, "3000-4000", PortPosition::Dst)],
        action: FilterAction::Accept,
        value: None,
    };
    let exprs = compile_rule(RuleRef::Filter(&rule), &CompileContext::new(Family::Ipv4)).unwrap();
    let comparisons = exprs
        .iter()
        .filter(|e| matches!(e, Expr::Cmp { .. }))
        .count();
    assert_eq!(comparisons, 2);
}

#[test]
fn validator_hook_matrix_cases() {
    let check = |family: Family, chain_type: ChainType, hook: ChainHook| {
        let mut table = Table::new("t", family);
        table.chains.push(Chain::new("c", chain_type, hook));
        TableValidator::new(&table).validate().is_empty()
    };

    assert!(!check(Family::Netdev, ChainType::Filter, ChainHook::Input));
    assert!(check(Family::Inet, ChainType::Filter, ChainHook::Ingress));
    assert!(check(Family::Ipv4, ChainType::Route, ChainHook::Output));
    assert!(!check(Family::Ipv4, ChainType::Route, ChainHook::Input));
}

#[test]
fn admission_refuses_addresses_of_the_other_family() {
    let denied = |family: Family, chain: Chain, sets: Vec<Set>| {
        let mut table = Table::new("t", family);
        table.chains.push(chain);
        table.sets = sets;
        matches!(
            Admission::new(&[]).review_create(table),
            AdmissionDecision::Denied(_)
        )
    };
    let filter = |value: &str| {
        let mut chain = Chain::new("in", ChainType::Filter, ChainHook::Input);
        chain.rules = RulesSet::filter(vec![FilterRule {
            name: Some("r".into()),
            matches: vec![Match::ip(MatchOp::Eq, value, IpPosition::Src)],
            action: FilterAction::Accept,
            value: None,
        }]);
        chain
    };
    let snat = |to: &str| {
        let mut chain = Chain::new("post", ChainType::Nat, ChainHook::Postrouting);
        chain.rules = RulesSet::nat(vec![NatRule {
            name: Some("out".into()),
            matches: vec![],
            nat_type: NatType::Snat,
            to: Some(to.into()),
            target_ref: None,
        }]);
        chain
    };
    let allowed = vec![Set {
        name: "allowed".into(),
        key_type: SetDataType::Ipv4Addr,
        data_type: None,
        elements: vec![],
    }];

    assert!(denied(Family::Ipv4, filter("fd00::1"), vec![]));
    assert!(!denied(Family::Ipv4, filter("10.0.0.1"), vec![]));
    assert!(denied(Family::Ipv6, filter("@allowed"), allowed.clone()));
    assert!(!denied(Family::Inet, filter("@allowed"), allowed));
    assert!(denied(Family::Ipv6, snat("203.0.113.1"), vec![]));
    assert!(!denied(Family::Ipv6, snat("2001:db8::1"), vec![]));
}

#[test]
fn dnat_hook_placement() {
    let check = |hook: ChainHook| {
        let mut chain = Chain::new("c", ChainType::Nat, hook);
        chain.rules = RulesSet::nat(vec![NatRule {
            name: Some("web".into()),
            matches: vec![Match::proto(MatchOp::Eq, L4Proto::Tcp)],
            nat_type: NatType::Dnat,
            to: Some("10.0.0.5".into()),
            target_ref: None,
        }]);
        let mut table = Table::new("t", Family::Ipv4);
        table.chains.push(chain);
        TableValidator::new(&table).validate().is_empty()
    };

    assert!(!check(ChainHook::Postrouting));
    assert!(check(ChainHook::Prerouting));
}

#[test]
fn set_element_bytes_match_ipv4_octets() {
    let element = LiveSetElement {
        key: vec![10, 0, 0, 1],
        data: None,
    };
    let set = edge_table().sets.remove(0);
    let encoded = fw_nft::encode_set_elements(&set).unwrap();
    assert_eq!(encoded[0], element);
}
