//! Multi-VM coordination tests: swarms, virtual stigmergy, and neighbor
//! broadcasts across real serialized packets.

use buzz_core::value::{TableKey, Value};
use buzz_core::MessageType;
use buzz_runtime::{OutMessage, Vm, VmState};
use bzzc::CompilerConfig;

fn boot(source: &str, robot: u16) -> Vm {
    let out = bzzc::compile_source(source, "test.bzz", &CompilerConfig::default())
        .expect("script compiles");
    let mut vm = Vm::new(robot);
    assert_eq!(vm.set_bcode(out.bcode), VmState::Ready);
    let state = vm.execute_script();
    assert_eq!(state, VmState::Done, "vm error: {}", vm.error_message());
    vm
}

/// One host control step: deliver, run `step`, drain, transmit.
fn host_step(vm: &mut Vm, inbound: &[Vec<u8>]) -> Vec<u8> {
    for packet in inbound {
        vm.receive_packet(packet);
    }
    vm.neighbors_reset();
    let state = vm.function_call("step", 0);
    assert_ne!(state, VmState::Error, "vm error: {}", vm.error_message());
    vm.process_in_messages();
    vm.process_out_messages();
    vm.send_packet()
}

fn global(vm: &Vm, name: &str) -> Value {
    match vm.get_global(name) {
        Some(r) => vm.heap().get(r).clone(),
        None => Value::Nil,
    }
}

fn string_key(vm: &Vm, text: &str) -> TableKey {
    let id = vm.strings().find(text).expect("string interned");
    TableKey::String(vm.strings().get_istr(id).expect("string live"))
}

#[test]
fn test_swarm_exec_sets_id_and_queues_join() {
    let vm = boot(
        "var g = swarm.create(4)\n\
         g.join()\n\
         g.exec(function() { result = swarm.id() })",
        1,
    );
    assert!(matches!(global(&vm, "result"), Value::Int(4)));
    let joins = vm
        .out_queue()
        .iter()
        .filter(|m| matches!(m, OutMessage::SwarmJoin { id: 4 }))
        .count();
    assert_eq!(joins, 1);
    // Membership is recorded locally.
    assert_eq!(vm.is_swarm_member(4), Some(true));
    // Outside a swarm context the swarm stack is empty again.
    let vm2 = boot("r = swarm.id()", 1);
    assert!(matches!(global(&vm2, "r"), Value::Nil));
}

#[test]
fn test_select_then_deselect_queues_opposite_messages() {
    let vm = boot(
        "var g = swarm.create(4)\n\
         g.select(1)\n\
         g.select(0)",
        1,
    );
    assert_eq!(vm.is_swarm_member(4), Some(false));
    let msgs: Vec<_> = vm.out_queue().iter().collect();
    assert!(msgs
        .iter()
        .any(|m| matches!(m, OutMessage::SwarmJoin { id: 4 })));
    assert!(msgs
        .iter()
        .any(|m| matches!(m, OutMessage::SwarmLeave { id: 4 })));
}

#[test]
fn test_swarm_composites() {
    let vm = boot(
        "var a = swarm.create(1)\n\
         var b = swarm.create(2)\n\
         a.join()\n\
         u = swarm.union(10, a, b).in()\n\
         i = swarm.intersection(11, a, b).in()\n\
         d = swarm.difference(12, a, b).in()",
        1,
    );
    assert!(matches!(global(&vm, "u"), Value::Int(1)));
    assert!(matches!(global(&vm, "i"), Value::Int(0)));
    assert!(matches!(global(&vm, "d"), Value::Int(1)));
}

#[test]
fn test_swarm_membership_propagates() {
    let mut a = boot(
        "var g = swarm.create(7)\ng.join()\nfunction step() {}",
        1,
    );
    let mut b = boot("function step() {}", 2);
    let packet_a = host_step(&mut a, &[]);
    host_step(&mut b, &[packet_a]);
    assert!(b.swarm_members().is_member(1, 7));
    // Leaves propagate too.
    let mut a2 = boot(
        "var g = swarm.create(7)\n\
         g.join()\n\
         function step() { g.leave() }",
        1,
    );
    let first = host_step(&mut a2, &[]);
    host_step(&mut b, &[first]);
    let second = host_step(&mut a2, &[]);
    host_step(&mut b, &[second]);
    assert!(!b.swarm_members().is_member(1, 7));
}

#[test]
fn test_stale_members_evicted() {
    let mut a = boot(
        "var g = swarm.create(7)\ng.join()\nfunction step() {}",
        1,
    );
    let mut b = boot("function step() {}", 2);
    let packet_a = host_step(&mut a, &[]);
    host_step(&mut b, &[packet_a]);
    assert!(b.swarm_members().is_member(1, 7));
    // Silence from robot 1 for longer than the max age.
    for _ in 0..60 {
        host_step(&mut b, &[]);
    }
    assert!(!b.swarm_members().is_member(1, 7));
}

#[test]
fn test_stigmergy_conflict_default_policy() {
    // Both robots write the same key in the same step; the higher robot
    // id must win on both sides.
    let source = "s = stigmergy.create(1)\n\
                  s.put(\"k\", 100)\n\
                  function step() {}";
    let mut a = boot(source, 3);
    let mut b = boot(source, 7);
    let pa = host_step(&mut a, &[]);
    let pb = host_step(&mut b, &[]);
    let pa2 = host_step(&mut a, &[pb]);
    let _ = host_step(&mut b, &[pa]);
    let _ = host_step(&mut b, &[pa2]);
    for vm in [&a, &b] {
        let key = string_key(vm, "k");
        let entry = vm
            .stigmergy(1)
            .and_then(|vs| vs.fetch(&key).copied())
            .expect("entry present");
        assert_eq!(entry.robot, 7, "higher robot id wins");
        match vm.heap().get(entry.data) {
            Value::Int(100) => {}
            other => panic!("expected 100, got {:?}", other),
        }
    }
}

#[test]
fn test_stigmergy_custom_conflict_manager() {
    // The manager picks the lower robot id, overriding the default.
    let source = "s = stigmergy.create(1)\n\
                  s.onconflict(function(k, local, remote) {\n\
                    if(local.robot < remote.robot) { return local }\n\
                    return remote\n\
                  })\n\
                  s.put(\"k\", 100)\n\
                  function step() {}";
    let mut a = boot(source, 3);
    let mut b = boot(source, 7);
    let pa = host_step(&mut a, &[]);
    let _ = host_step(&mut b, &[pa]);
    let key = string_key(&b, "k");
    let entry = b
        .stigmergy(1)
        .and_then(|vs| vs.fetch(&key).copied())
        .expect("entry present");
    assert_eq!(entry.robot, 3, "manager picked the lower id");
}

#[test]
fn test_stigmergy_value_propagates() {
    let writer = "s = stigmergy.create(9)\n\
                  s.put(\"shared\", 41)\n\
                  function step() {}";
    let reader = "s = stigmergy.create(9)\n\
                  function step() { seen = s.get(\"shared\") }";
    let mut a = boot(writer, 1);
    let mut b = boot(reader, 2);
    let pa = host_step(&mut a, &[]);
    host_step(&mut b, &[pa]);
    host_step(&mut b, &[]);
    assert!(matches!(global(&b, "seen"), Value::Int(41)));
}

#[test]
fn test_stigmergy_query_announces_interest() {
    let vm = boot(
        "s = stigmergy.create(2)\nx = s.get(\"unknown\")",
        5,
    );
    assert!(matches!(global(&vm, "x"), Value::Nil));
    let queries: Vec<_> = vm
        .out_queue()
        .iter()
        .filter(|m| matches!(m, OutMessage::VStig { query: true, .. }))
        .collect();
    assert_eq!(queries.len(), 1);
}

#[test]
fn test_broadcast_and_listen() {
    let speaker = "function step() { neighbors.broadcast(\"alert\", 42) }";
    let listener = "neighbors.listen(\"alert\", function(topic, value, rid) {\n\
                      got = value\n\
                      from = rid\n\
                    })\n\
                    function step() {}";
    let mut a = boot(speaker, 9);
    let mut b = boot(listener, 2);
    let pa = host_step(&mut a, &[]);
    host_step(&mut b, &[pa]);
    assert!(matches!(global(&b, "got"), Value::Int(42)));
    assert!(matches!(global(&b, "from"), Value::Int(9)));
}

#[test]
fn test_ignore_stops_listening() {
    let speaker = "function step() { neighbors.broadcast(\"alert\", 1) }";
    let listener = "neighbors.listen(\"alert\", function(t, v, r) { count = count + 1 })\n\
                    count = 0\n\
                    function step() {\n\
                      if(count > 0) { neighbors.ignore(\"alert\") }\n\
                    }";
    let mut a = boot(speaker, 9);
    let mut b = boot(listener, 2);
    for _ in 0..4 {
        let pa = host_step(&mut a, &[]);
        host_step(&mut b, &[pa]);
    }
    // One delivery arms the ignore; everything after is dropped.
    match global(&b, "count") {
        Value::Int(n) => assert!(n <= 2, "listener kept firing: {}", n),
        other => panic!("expected int, got {:?}", other),
    }
}

#[test]
fn test_neighbor_queries() {
    let mut vm = boot(
        "function step() {\n\
           n = neighbors.count()\n\
           near = neighbors.filter(function(rid, data) {\n\
             return data.distance < 2.0\n\
           }).count()\n\
           total = neighbors.reduce(function(rid, data, acc) {\n\
             return acc + data.distance\n\
           }, 0.0)\n\
           seven = neighbors.get(7).distance\n\
         }",
        1,
    );
    vm.neighbors_reset();
    vm.neighbors_add(7, 1.5, 0.0, 0.0);
    vm.neighbors_add(8, 3.0, 1.0, 0.0);
    let state = vm.function_call("step", 0);
    assert_ne!(state, VmState::Error, "vm error: {}", vm.error_message());
    assert!(matches!(global(&vm, "n"), Value::Int(2)));
    assert!(matches!(global(&vm, "near"), Value::Int(1)));
    match global(&vm, "total") {
        Value::Float(f) => assert_eq!(f, 4.5),
        other => panic!("expected float, got {:?}", other),
    }
    match global(&vm, "seven") {
        Value::Float(f) => assert_eq!(f, 1.5),
        other => panic!("expected float, got {:?}", other),
    }
}

#[test]
fn test_kin_nonkin_split() {
    let mut vm = boot(
        "var g = swarm.create(3)\n\
         g.join()\n\
         function step() {\n\
           g.exec(function() {\n\
             kin = neighbors.kin().count()\n\
             nonkin = neighbors.nonkin().count()\n\
           })\n\
         }",
        1,
    );
    vm.neighbors_reset();
    vm.neighbors_add(10, 1.0, 0.0, 0.0);
    vm.neighbors_add(11, 1.0, 0.0, 0.0);
    // Only robot 10 is known to share swarm 3. The first step call
    // brings the VM back to ready so the join can be processed.
    vm.receive_packet(&make_swarm_join_packet(10, 3));
    vm.function_call("step", 0);
    vm.process_in_messages();
    let state = vm.function_call("step", 0);
    assert_ne!(state, VmState::Error, "vm error: {}", vm.error_message());
    assert!(matches!(global(&vm, "kin"), Value::Int(1)));
    assert!(matches!(global(&vm, "nonkin"), Value::Int(1)));
}

/// Hand-frame a packet carrying one SwarmJoin payload.
fn make_swarm_join_packet(robot: u16, swarm: u16) -> Vec<u8> {
    let mut payload = Vec::new();
    payload.push(MessageType::SwarmJoin as u8);
    payload.extend_from_slice(&swarm.to_le_bytes());
    let mut packet = Vec::new();
    packet.extend_from_slice(&robot.to_le_bytes());
    packet.extend_from_slice(&(payload.len() as u16).to_le_bytes());
    packet.extend_from_slice(&payload);
    packet.resize(100, 0);
    packet
}

#[test]
fn test_swarm_list_heartbeat() {
    let mut vm = boot(
        "var g = swarm.create(5)\ng.join()\nfunction step() {}",
        1,
    );
    // The heartbeat fires once the broadcast countdown expires.
    let mut saw_list = false;
    for _ in 0..12 {
        let packet = host_step(&mut vm, &[]);
        // Check the packet for a swarm-list payload (type byte 1).
        let mut pos = 2;
        while pos + 2 <= packet.len() {
            let len = u16::from_le_bytes([packet[pos], packet[pos + 1]]) as usize;
            if len == 0 {
                break;
            }
            if packet[pos + 2] == MessageType::SwarmList as u8 {
                saw_list = true;
            }
            pos += 2 + len;
        }
    }
    assert!(saw_list, "no swarm list broadcast within the period");
}
