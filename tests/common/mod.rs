//! Shared test fixtures: a hosted HAL and scripted ring/register mocks.
//!
//! `TestHal` backs DMA allocations with the process heap and identity-maps
//! physical to virtual, so the tests can read and write "DMA" memory through
//! the addresses programmed into the mock rings.

#![allow(dead_code)]

use std::collections::VecDeque;
use std::ptr::NonNull;
use std::sync::{Arc, Mutex};

use hif_driver::{
    BdEntry, BdRing, Channel, ChannelConfig, ChannelHw, ClientEvent, ClientEventSink, HifError,
    HifHal, HifResult, IrqEvents, PhysAddr, RxHeader,
};

pub struct TestHal;

unsafe impl HifHal for TestHal {
    fn dma_alloc(size: usize) -> (PhysAddr, NonNull<u8>) {
        let layout = std::alloc::Layout::from_size_align(size, 4096).unwrap();
        let ptr = unsafe { std::alloc::alloc_zeroed(layout) };
        assert!(!ptr.is_null());
        (ptr as usize, NonNull::new(ptr).unwrap())
    }

    unsafe fn dma_dealloc(_paddr: PhysAddr, vaddr: NonNull<u8>, size: usize) -> i32 {
        let layout = std::alloc::Layout::from_size_align(size, 4096).unwrap();
        std::alloc::dealloc(vaddr.as_ptr(), layout);
        0
    }

    unsafe fn mmio_virt_to_phys(vaddr: NonNull<u8>, _size: usize) -> PhysAddr {
        vaddr.as_ptr() as usize
    }

    fn sleep_us(_us: u32) {
        std::thread::yield_now();
    }
}

/// Scripted descriptor ring state, shared between the mock handed to the
/// channel and the test body.
pub struct RingState {
    pub capacity: usize,
    /// Enqueued, still owned by the "hardware".
    pub pending: VecDeque<BdEntry>,
    /// Completed, ready for dequeue.
    pub completed: VecDeque<BdEntry>,
    /// Complete entries immediately as they are enqueued.
    pub auto_complete: bool,
    /// Remaining enqueues to accept before failing unconditionally.
    pub fail_after: Option<usize>,
    /// Every accepted enqueue, in order.
    pub log: Vec<BdEntry>,
}

impl RingState {
    fn fill(&self) -> usize {
        self.pending.len() + self.completed.len()
    }
}

#[derive(Clone)]
pub struct RingHandle(pub Arc<Mutex<RingState>>);

impl RingHandle {
    pub fn new(capacity: usize, auto_complete: bool) -> RingHandle {
        RingHandle(Arc::new(Mutex::new(RingState {
            capacity,
            pending: VecDeque::new(),
            completed: VecDeque::new(),
            auto_complete,
            fail_after: None,
            log: Vec::new(),
        })))
    }

    /// The `BdRing` object to hand to `Channel::create`.
    pub fn ring(&self) -> Box<dyn BdRing> {
        Box::new(MockRing {
            state: Arc::clone(&self.0),
        })
    }

    /// Marks the oldest `n` pending entries as hardware-completed.
    pub fn complete(&self, n: usize) {
        let mut s = self.0.lock().unwrap();
        for _ in 0..n {
            let entry = s.pending.pop_front().expect("nothing pending to complete");
            s.completed.push_back(entry);
        }
    }

    pub fn complete_all(&self) {
        let n = self.0.lock().unwrap().pending.len();
        self.complete(n);
    }

    /// Accept `n` more enqueues, then reject every one after that.
    pub fn fail_after(&self, n: usize) {
        self.0.lock().unwrap().fail_after = Some(n);
    }

    pub fn clear_fail(&self) {
        self.0.lock().unwrap().fail_after = None;
    }

    pub fn fill_level(&self) -> usize {
        self.0.lock().unwrap().fill()
    }

    pub fn log(&self) -> Vec<BdEntry> {
        self.0.lock().unwrap().log.clone()
    }

    /// Completes the oldest pending RX descriptor as one received chunk:
    /// writes the wire header (first chunk of a frame) and payload into the
    /// buffer through the identity mapping, then moves the entry to the
    /// completed queue with the resulting length and last-in-frame flag.
    pub fn receive_chunk(&self, header: Option<RxHeader>, payload: &[u8], lifm: bool) {
        let mut s = self.0.lock().unwrap();
        let mut entry = s.pending.pop_front().expect("no rx buffer supplied");
        let base = entry.addr as *mut u8;
        let mut offset = 0;
        if let Some(h) = header {
            let hdr_buf =
                unsafe { std::slice::from_raw_parts_mut(base, hif_driver::HIF_HEADER_SIZE) };
            h.write(hdr_buf);
            offset = hif_driver::HIF_HEADER_SIZE;
        }
        unsafe {
            std::ptr::copy_nonoverlapping(payload.as_ptr(), base.add(offset), payload.len());
        }
        entry.len = (offset + payload.len()) as u16;
        entry.lifm = lifm;
        s.completed.push_back(entry);
    }
}

struct MockRing {
    state: Arc<Mutex<RingState>>,
}

impl BdRing for MockRing {
    fn capacity(&self) -> usize {
        self.state.lock().unwrap().capacity
    }

    fn fill_level(&self) -> usize {
        self.state.lock().unwrap().fill()
    }

    fn enqueue(&mut self, addr: PhysAddr, len: u16, lifm: bool) -> HifResult<()> {
        let mut s = self.state.lock().unwrap();
        if let Some(remaining) = s.fail_after {
            if remaining == 0 {
                return Err(HifError::NoSpace);
            }
            s.fail_after = Some(remaining - 1);
        }
        if s.fill() >= s.capacity - 1 {
            return Err(HifError::NoSpace);
        }
        let entry = BdEntry { addr, len, lifm };
        s.log.push(entry);
        if s.auto_complete {
            s.completed.push_back(entry);
        } else {
            s.pending.push_back(entry);
        }
        Ok(())
    }

    fn dequeue(&mut self) -> Option<BdEntry> {
        self.state.lock().unwrap().completed.pop_front()
    }

    fn drain(&mut self) -> Option<BdEntry> {
        let mut s = self.state.lock().unwrap();
        s.completed.pop_front().or_else(|| s.pending.pop_front())
    }
}

/// Scripted channel register state.
pub struct HwState {
    pub ring_depth: usize,
    pub rx_enabled: bool,
    pub tx_enabled: bool,
    /// Reads of `rx_dma_active` that still report `true` after a disable.
    pub rx_active_polls: u32,
    pub tx_active_polls: u32,
    pub doorbells: usize,
    /// Reads of `bd_fetch_empty` that still report `false`.
    pub fetch_busy_reads: usize,
    pub pending_irq: IrqEvents,
    pub masked: IrqEvents,
}

#[derive(Clone)]
pub struct HwHandle(pub Arc<Mutex<HwState>>);

impl HwHandle {
    pub fn new(ring_depth: usize) -> HwHandle {
        HwHandle(Arc::new(Mutex::new(HwState {
            ring_depth,
            rx_enabled: false,
            tx_enabled: false,
            rx_active_polls: 0,
            tx_active_polls: 0,
            doorbells: 0,
            fetch_busy_reads: 0,
            pending_irq: IrqEvents::empty(),
            masked: IrqEvents::all(),
        })))
    }

    pub fn hw(&self) -> Box<dyn ChannelHw> {
        Box::new(MockHw {
            state: Arc::clone(&self.0),
        })
    }

    pub fn raise_irq(&self, events: IrqEvents) {
        self.0.lock().unwrap().pending_irq.insert(events);
    }

    pub fn doorbells(&self) -> usize {
        self.0.lock().unwrap().doorbells
    }

    pub fn rx_enabled(&self) -> bool {
        self.0.lock().unwrap().rx_enabled
    }

    pub fn tx_enabled(&self) -> bool {
        self.0.lock().unwrap().tx_enabled
    }

    pub fn masked(&self) -> IrqEvents {
        self.0.lock().unwrap().masked
    }

    /// Makes `bd_fetch_empty` report busy for the next `n` reads.
    pub fn set_fetch_busy(&self, n: usize) {
        self.0.lock().unwrap().fetch_busy_reads = n;
    }

    /// Makes the DMA-active flags linger for the given number of polls after
    /// the next disable.
    pub fn set_active_polls(&self, rx: u32, tx: u32) {
        let mut s = self.0.lock().unwrap();
        s.rx_active_polls = rx;
        s.tx_active_polls = tx;
    }
}

struct MockHw {
    state: Arc<Mutex<HwState>>,
}

impl ChannelHw for MockHw {
    fn ring_depth(&self) -> usize {
        self.state.lock().unwrap().ring_depth
    }

    fn rx_dma_enable(&mut self) {
        self.state.lock().unwrap().rx_enabled = true;
    }

    fn rx_dma_disable(&mut self) {
        self.state.lock().unwrap().rx_enabled = false;
    }

    fn rx_dma_active(&self) -> bool {
        let mut s = self.state.lock().unwrap();
        if s.rx_active_polls > 0 {
            s.rx_active_polls -= 1;
            true
        } else {
            false
        }
    }

    fn tx_dma_enable(&mut self) {
        self.state.lock().unwrap().tx_enabled = true;
    }

    fn tx_dma_disable(&mut self) {
        self.state.lock().unwrap().tx_enabled = false;
    }

    fn tx_dma_active(&self) -> bool {
        let mut s = self.state.lock().unwrap();
        if s.tx_active_polls > 0 {
            s.tx_active_polls -= 1;
            true
        } else {
            false
        }
    }

    fn tx_dma_start(&mut self) {
        self.state.lock().unwrap().doorbells += 1;
    }

    fn bd_fetch_empty(&self) -> bool {
        let mut s = self.state.lock().unwrap();
        if s.fetch_busy_reads > 0 {
            s.fetch_busy_reads -= 1;
            false
        } else {
            true
        }
    }

    fn irq_status(&mut self) -> IrqEvents {
        let mut s = self.state.lock().unwrap();
        let events = s.pending_irq;
        s.pending_irq = IrqEvents::empty();
        events
    }

    fn irq_mask(&mut self, events: IrqEvents) {
        self.state.lock().unwrap().masked.insert(events);
    }

    fn irq_unmask(&mut self, events: IrqEvents) {
        self.state.lock().unwrap().masked.remove(events);
    }
}

/// One mock channel's worth of collaborators.
pub struct TestBench {
    pub rx: RingHandle,
    pub tx: RingHandle,
    pub hw: HwHandle,
}

impl TestBench {
    pub fn new(depth: usize) -> TestBench {
        TestBench {
            rx: RingHandle::new(depth, false),
            tx: RingHandle::new(depth, false),
            hw: HwHandle::new(depth),
        }
    }

    pub fn channel(&self, config: ChannelConfig) -> Channel<TestHal> {
        Channel::create(0, self.hw.hw(), self.rx.ring(), self.tx.ring(), config)
            .expect("channel creation failed")
    }
}

/// Event sink that records everything it sees.
#[derive(Default)]
pub struct EventRecorder {
    events: Mutex<Vec<ClientEvent>>,
}

impl EventRecorder {
    pub fn new() -> Arc<EventRecorder> {
        Arc::new(EventRecorder::default())
    }

    /// Removes and returns all recorded events.
    pub fn take(&self) -> Vec<ClientEvent> {
        std::mem::take(&mut *self.events.lock().unwrap())
    }

    pub fn count(&self, event: ClientEvent) -> usize {
        self.events.lock().unwrap().iter().filter(|e| **e == event).count()
    }
}

impl ClientEventSink for EventRecorder {
    fn event(&self, event: ClientEvent) {
        self.events.lock().unwrap().push(event);
    }
}
