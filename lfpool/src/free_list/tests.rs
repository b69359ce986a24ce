use std::{collections::HashSet, ptr::NonNull, sync::atomic::Ordering};

use crate::{backing::Backing, backing::Tag, entry::ClassId, util::UsizePtr};

use super::*;

fn assert_send<T: Send>() {}
fn assert_sync<T: Sync>() {}

fn new_entry(backing: &Backing) -> NonNull<Entry> {
    Entry::create(backing, 16, ClassId::fixed(4), Tag::DEFAULT).unwrap()
}

fn from_usize(x: UsizePtr) -> NonNull<Entry> {
    NonNull::new(x.0 as *mut Entry).unwrap()
}

fn destroy_all(list: &FreeList, backing: &Backing) -> usize {
    list.drain_all(|e| unsafe { Entry::destroy(backing, e) })
}

#[test]
fn ensure_free_list_send_sync() {
    assert_send::<FreeList>();
    assert_sync::<FreeList>();
}

#[cfg(not(loom))]
#[test]
fn free_list_push_pop_lifo() {
    let backing = Backing::system();
    let list = FreeList::new();
    assert!(list.is_empty());

    let a = new_entry(&backing);
    let b = new_entry(&backing);
    unsafe {
        list.push(a);
        list.push(b);
    }
    assert!(!list.is_empty());

    assert_eq!(list.pop(), Some(b));
    assert_eq!(list.pop(), Some(a));
    assert_eq!(list.pop(), None);
    assert_eq!(list.readers(), 0);

    // nobody else was around, so both are back at the baseline
    unsafe {
        assert_eq!(a.as_ref().ref_count(), BASELINE_REF);
        assert_eq!(b.as_ref().ref_count(), BASELINE_REF);
        Entry::destroy(&backing, a);
        Entry::destroy(&backing, b);
    }
    assert!(backing.ledger().report().is_clean());
}

#[cfg(not(loom))]
#[test]
fn free_list_drain_all() {
    let backing = Backing::system();
    let list = FreeList::new();
    for _ in 0..10 {
        unsafe { list.push(new_entry(&backing)) };
    }
    assert_eq!(destroy_all(&list, &backing), 10);
    assert!(list.is_empty());
    assert_eq!(destroy_all(&list, &backing), 0);
    assert!(backing.ledger().report().is_clean());
}

#[cfg(not(loom))]
#[test]
fn free_list_take_all_detaches() {
    let backing = Backing::system();
    let list = FreeList::new();
    let a = new_entry(&backing);
    let b = new_entry(&backing);
    unsafe {
        list.push(a);
        list.push(b);
    }
    let chain = list.take_all();
    assert!(!chain.is_empty());
    assert!(list.is_empty());
    list.wait_quiescent();
    let entries = chain.collect::<Vec<_>>();
    assert_eq!(entries, vec![b, a]);
    for e in entries {
        unsafe { Entry::destroy(&backing, e) };
    }
}

#[cfg(not(loom))]
#[test]
fn free_list_pop_with_other_reader_leaves_count() {
    let backing = Backing::system();
    let list = FreeList::new();
    let x = new_entry(&backing);
    unsafe { list.push(x) };

    // pretend another thread is somewhere inside pop
    list.readers.fetch_add(1, Ordering::SeqCst);
    assert_eq!(list.pop(), Some(x));
    // popper could not drop its count
    assert_eq!(unsafe { x.as_ref() }.ref_count(), BASELINE_REF + 1);
    list.readers.fetch_sub(1, Ordering::SeqCst);

    // giving it back takes the slow path, which ends up pushing it
    assert!(unsafe { list.push_returned(x) });
    unsafe {
        assert_eq!(x.as_ref().ref_count(), BASELINE_REF);
        assert!(x.as_ref().owned.load(Ordering::SeqCst));
    }
    assert_eq!(list.readers(), 0);
    assert_eq!(list.pop(), Some(x));
    unsafe { Entry::destroy(&backing, x) };
}

#[cfg(not(loom))]
#[test]
fn free_list_stale_reader_adopts_returned_entry() {
    let backing = Backing::system();
    let list = FreeList::new();
    let x = new_entry(&backing);
    unsafe { list.push(x) };

    // a stale reader registers and marks interest in x (pop steps 1-3)
    list.readers.fetch_add(1, Ordering::SeqCst);
    unsafe { x.as_ref() }.ref_count.fetch_add(1, Ordering::SeqCst);

    // meanwhile x gets popped and given back
    assert_eq!(list.pop(), Some(x));
    assert_eq!(unsafe { x.as_ref() }.ref_count(), BASELINE_REF + 2);
    assert!(!unsafe { list.push_returned(x) });
    assert!(list.is_empty());

    // the stale reader notices x moved, drops back to the baseline,
    // and wins the ownership token (pop step 5)
    let e = unsafe { x.as_ref() };
    let prev = e.ref_count.fetch_sub(1, Ordering::SeqCst);
    assert_eq!(prev - 1, BASELINE_REF);
    assert!(e
        .owned
        .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
        .is_ok());
    list.readers.fetch_sub(1, Ordering::SeqCst);

    unsafe { Entry::destroy(&backing, x) };
    assert!(backing.ledger().report().is_clean());
}

#[cfg(not(loom))]
#[test]
fn free_list_try_claim_release() {
    let backing = Backing::system();
    let list = FreeList::new();

    let fresh = new_entry(&backing);
    assert!(list.try_claim_release(unsafe { fresh.as_ref() }));
    assert_eq!(unsafe { fresh.as_ref() }.ref_count(), 0);

    let busy = new_entry(&backing);
    unsafe { busy.as_ref() }
        .ref_count
        .fetch_add(1, Ordering::SeqCst);
    list.readers.fetch_add(1, Ordering::SeqCst);
    assert!(!list.try_claim_release(unsafe { busy.as_ref() }));
    list.readers.fetch_sub(1, Ordering::SeqCst);
    assert!(list.try_claim_release(unsafe { busy.as_ref() }));

    unsafe {
        Entry::destroy(&backing, fresh);
        Entry::destroy(&backing, busy);
    }
}

#[cfg(not(loom))]
#[test]
fn free_list_concurrent_pop_no_duplicates() {
    let backing = Backing::system();
    let list = FreeList::new();
    let n = 20_000;
    for _ in 0..n {
        unsafe { list.push(new_entry(&backing)) };
    }

    let popped = std::thread::scope(|s| {
        let handles = (0..4)
            .map(|_| {
                s.spawn(|| {
                    let mut mine = Vec::new();
                    while let Some(e) = list.pop() {
                        mine.push(UsizePtr::from(e));
                    }
                    mine
                })
            })
            .collect::<Vec<_>>();
        handles
            .into_iter()
            .flat_map(|h| h.join().unwrap())
            .collect::<Vec<_>>()
    });

    assert_eq!(popped.len(), n);
    let unique = popped.iter().copied().collect::<HashSet<_>>();
    assert_eq!(unique.len(), n);
    assert_eq!(list.readers(), 0);

    for e in popped {
        unsafe { Entry::destroy(&backing, from_usize(e)) };
    }
    assert!(backing.ledger().report().is_clean());
}

#[cfg(not(loom))]
#[test]
fn free_list_concurrent_churn() {
    let backing = Backing::system();
    let list = FreeList::new();
    let n = 8;
    for _ in 0..n {
        unsafe { list.push(new_entry(&backing)) };
    }

    std::thread::scope(|s| {
        for tid in 1..=4u64 {
            let list = &list;
            s.spawn(move || {
                for _ in 0..50_000 {
                    let Some(e) = list.pop() else {
                        continue;
                    };
                    let payload = Entry::payload(e).cast::<u64>();
                    unsafe {
                        // if anybody else got handed this entry too,
                        // chances are they scribble over this
                        payload.as_ptr().write_volatile(tid);
                        for _ in 0..8 {
                            std::hint::spin_loop();
                        }
                        assert_eq!(payload.as_ptr().read_volatile(), tid);
                        list.push_returned(e);
                    }
                }
            });
        }
    });

    // every entry found its way back
    assert_eq!(list.readers(), 0);
    assert_eq!(destroy_all(&list, &backing), n);
    assert!(backing.ledger().report().is_clean());
}

#[cfg(loom)]
#[test]
fn free_list_loom_two_poppers() {
    loom::model(|| {
        let backing = &*Box::leak(Box::new(Backing::system()));
        let list = &*Box::leak(Box::new(FreeList::new()));
        let a = new_entry(backing);
        let b = new_entry(backing);
        unsafe {
            list.push(a);
            list.push(b);
        }

        let t0 = loom::thread::spawn(move || list.pop().map(UsizePtr::from));
        let t1 = loom::thread::spawn(move || list.pop().map(UsizePtr::from));

        let got0 = t0.join().unwrap().unwrap();
        let got1 = t1.join().unwrap().unwrap();
        assert!(got0 != got1);
        assert!(list.is_empty());
        assert_eq!(list.readers(), 0);

        unsafe {
            Entry::destroy(backing, from_usize(got0));
            Entry::destroy(backing, from_usize(got1));
        }
    })
}

#[cfg(loom)]
#[test]
fn free_list_loom_pop_vs_return() {
    loom::model(|| {
        let backing = &*Box::leak(Box::new(Backing::system()));
        let list = &*Box::leak(Box::new(FreeList::new()));
        let a = new_entry(backing);
        let b = new_entry(backing);
        unsafe {
            list.push(a);
            list.push(b);
        }

        let t0 = loom::thread::spawn(move || {
            if let Some(e) = list.pop() {
                unsafe { list.push_returned(e) };
            }
        });
        let t1 = loom::thread::spawn(move || list.pop().map(UsizePtr::from));

        t0.join().unwrap();
        let held = t1.join().unwrap();

        // nothing lost, nothing duplicated
        let mut all = list.take_all().map(UsizePtr::from).collect::<Vec<_>>();
        if let Some(held) = held {
            all.push(held);
        }
        all.sort();
        all.dedup();
        assert_eq!(all.len(), 2);

        for e in all {
            unsafe { Entry::destroy(backing, from_usize(e)) };
        }
    })
}
