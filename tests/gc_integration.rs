//! Collector-facing behavior: buffer copies under collection pressure and
//! the write barrier during incremental marking.

use jitcore::gc::barrier::record_heap_edge_entry;
use jitcore::gc::buffer::{attach_new_buffer, copy_from_object, grow_or_copy, resize};
use jitcore::gc::RootSet;
use jitcore::vm::{Heap, ObjRef, ObjectKind, Value};

fn rooted_string(heap: &mut Heap, roots: &mut RootSet, contents: &[u8]) -> ObjRef {
    let s = heap.alloc_container(ObjectKind::String).unwrap();
    roots.register_process_root(heap, s).unwrap();
    attach_new_buffer(heap, s, contents.len().max(8)).unwrap();
    heap.write_bytes(s, 0, contents).unwrap();
    s
}

#[test]
fn test_grow_from_unrooted_source_under_stress() {
    let mut heap = Heap::new();
    let mut roots = RootSet::new();
    let target = rooted_string(&mut heap, &mut roots, b"");

    // Reachable only through the pin taken by the copy itself.
    let source = heap.alloc_container(ObjectKind::String).unwrap();
    {
        let mut heap = heap.keep_alive(source);
        attach_new_buffer(&mut heap, source, 16).unwrap();
        heap.write_bytes(source, 0, b"moving target").unwrap();
    }

    heap.set_gc_stress(true);
    let src_ptr = heap.buffer_ptr(source).unwrap();
    let buffer = unsafe { grow_or_copy(&mut heap, target, 32, Some(source), src_ptr, 13) }.unwrap();
    heap.set_length(target, 13).unwrap();

    assert_eq!(heap.bytes(target).unwrap(), b"moving target");
    assert_eq!(heap.get(target).unwrap().buffer(), Some(buffer));
    // Once the copy is done the source is ordinary garbage again.
    heap.collect();
    assert!(!heap.is_markable(source));
}

#[test]
fn test_grow_while_marking_keeps_source() {
    let mut heap = Heap::new();
    let mut roots = RootSet::new();
    let target = rooted_string(&mut heap, &mut roots, b"");
    let source = heap.alloc_container(ObjectKind::String).unwrap();
    {
        let mut heap = heap.keep_alive(source);
        attach_new_buffer(&mut heap, source, 16).unwrap();
        heap.write_bytes(source, 0, b"marked late").unwrap();
    }

    heap.start_marking();
    heap.set_gc_stress(true);
    let mut heap = heap.keep_alive(source);
    let src_ptr = heap.buffer_ptr(source).unwrap();
    let buffer = unsafe { grow_or_copy(&mut heap, target, 32, Some(source), src_ptr, 11) }.unwrap();
    heap.set_length(target, 11).unwrap();

    assert!(heap.is_markable(source));
    assert_ne!(heap.get(source).unwrap().buffer(), Some(buffer));
    assert_eq!(heap.bytes(source).unwrap(), b"marked late");
    assert_eq!(heap.bytes(target).unwrap(), b"marked late");
}

#[test]
fn test_repeated_growth_keeps_contents() {
    let mut heap = Heap::new();
    let mut roots = RootSet::new();
    heap.set_gc_stress(true);
    let s = rooted_string(&mut heap, &mut roots, b"seed");

    let mut capacity = 8;
    for _ in 0..6 {
        capacity *= 2;
        let len = heap.length(s).unwrap();
        copy_from_object(&mut heap, s, capacity, s, 0, len).unwrap();
        let len = heap.length(s).unwrap();
        heap.write_bytes(s, len, b"+").unwrap();
    }
    assert_eq!(heap.capacity(s).unwrap(), 512);
    assert_eq!(heap.bytes(s).unwrap(), b"seed++++++");

    resize(&mut heap, s, 6).unwrap();
    assert_eq!(heap.bytes(s).unwrap(), b"seed++");
}

/// Three objects: `early` gets scanned first, `late` is still gray, and
/// each of `moved` is reachable only from `late` when marking starts.
struct MarkScenario {
    heap: Heap,
    early: ObjRef,
    late: ObjRef,
    moved: Vec<ObjRef>,
}

fn scenario(k: usize) -> MarkScenario {
    let mut heap = Heap::new();
    let early = heap.alloc_object(k).unwrap();
    let late = heap.alloc_object(k).unwrap();
    let moved: Vec<ObjRef> = (0..k).map(|_| heap.alloc_object(0).unwrap()).collect();
    for (i, m) in moved.iter().enumerate() {
        heap.store_field(late, i, Value::Ref(*m)).unwrap();
    }
    // Gray objects are scanned last-in first-out.
    heap.register_permanent_root(late).unwrap();
    heap.register_permanent_root(early).unwrap();

    heap.start_marking();
    heap.mark_step(1);
    assert!(heap.get(early).unwrap().is_marked());
    MarkScenario {
        heap,
        early,
        late,
        moved,
    }
}

#[test]
fn test_barrier_rescues_edges_stored_during_marking() {
    const K: usize = 5;
    let MarkScenario {
        mut heap,
        early,
        late,
        moved,
    } = scenario(K);
    let edges_before = heap.barrier().edges_recorded();

    for (i, m) in moved.iter().enumerate() {
        heap.store_field_unbarriered(early, i, Value::Ref(*m)).unwrap();
        heap.barrier().record_heap_edge(early, Value::Ref(*m));
        heap.store_field_unbarriered(late, i, Value::Nil).unwrap();
    }
    assert_eq!(heap.barrier().edges_recorded() - edges_before, K as u64);

    heap.finish_collection();
    for m in &moved {
        assert!(heap.is_markable(*m));
    }
}

#[test]
fn test_missing_barrier_loses_the_object() {
    let MarkScenario {
        mut heap,
        early,
        late,
        moved,
    } = scenario(1);

    heap.store_field_unbarriered(early, 0, Value::Ref(moved[0])).unwrap();
    heap.store_field_unbarriered(late, 0, Value::Nil).unwrap();

    heap.finish_collection();
    assert!(!heap.is_markable(moved[0]));
}

#[test]
fn test_generated_code_barrier_entry() {
    let MarkScenario {
        mut heap,
        early,
        late,
        moved,
    } = scenario(1);

    heap.store_field_unbarriered(early, 0, Value::Ref(moved[0])).unwrap();
    let barrier = std::sync::Arc::as_ptr(heap.barrier());
    unsafe { record_heap_edge_entry(barrier, early.index(), moved[0].index()) };
    heap.store_field_unbarriered(late, 0, Value::Nil).unwrap();

    heap.finish_collection();
    assert!(heap.is_markable(moved[0]));
}

#[test]
fn test_objects_allocated_while_marking_survive() {
    let mut heap = Heap::new();
    heap.start_marking();
    let fresh = heap.alloc_object(0).unwrap();
    heap.finish_collection();
    assert!(heap.is_markable(fresh));

    heap.collect();
    assert!(!heap.is_markable(fresh));
}
