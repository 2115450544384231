use engine_rt::queue::QueueError;
use engine_rt::EventQueue;

#[test]
fn push_and_pop() {
    let queue = EventQueue::new(2);
    queue.try_push(1usize).unwrap();
    queue.try_push(2usize).unwrap();
    assert_eq!(queue.try_push(3usize), Err(QueueError::Full));
    assert_eq!(queue.try_pop().unwrap(), 1);
    assert_eq!(queue.try_pop().unwrap(), 2);
    assert_eq!(queue.try_pop(), Err(QueueError::Empty));
}

#[test]
fn force_push_evicts_oldest() {
    let queue = EventQueue::new(2);
    assert_eq!(queue.force_push(1u8), None);
    assert_eq!(queue.force_push(2u8), None);
    assert_eq!(queue.force_push(3u8), Some(1));
    let mut seen = Vec::new();
    assert_eq!(queue.drain_into(8, |value| seen.push(value)), 2);
    assert_eq!(seen, vec![2, 3]);
    assert!(queue.is_empty());
}

#[test]
fn clones_share_storage() {
    let producer = EventQueue::new(4);
    let consumer = producer.clone();
    let handle = std::thread::spawn(move || {
        for value in 0..4u32 {
            producer.try_push(value).unwrap();
        }
    });
    handle.join().unwrap();
    assert_eq!(consumer.len(), 4);
    assert_eq!(consumer.drain_into(2, |_| {}), 2);
    assert_eq!(consumer.len(), 2);
}
