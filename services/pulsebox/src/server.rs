//! The request server: accepts framed requests over TCP, drives the
//! frontend interface, and routes replies (including the deferred ones —
//! sequence notifications and hardware reads) back to the connection that
//! asked.
//!
//! Reply shapes follow the request table; a malformed request gets the
//! single-byte `0xff` error reply and is never enqueued. `set_startup`
//! replies `[0]` on success or `[1, line u32, col_start u32, col_end u32,
//! message]` on a syntax error.

use std::cell::RefCell;
use std::collections::HashMap;
use std::io::{Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::os::unix::io::AsRawFd;
use std::path::PathBuf;
use std::rc::Rc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::Context;
use byteorder::{ByteOrder, LittleEndian};
use pulser::NDDS;

use crate::api::{pack_dds_addr, unpack_dds_addr, DdsType, SeqEvent, NTTL};
use crate::config::Config;
use crate::controller;
use crate::evt::{self, EventFd};
use crate::iface::CtrlIface;
use crate::names::NamesConfig;
use crate::proto::{encode, FrameReader};
use crate::seq::cmdlist;
use crate::startup::Startup;

const ERR_REPLY: [u8; 1] = [0xff];
const POLL_TIMEOUT_MS: i32 = 100;

struct Conn {
    stream: TcpStream,
    rd: FrameReader,
    wr: Vec<u8>,
}

struct SeqWait {
    what: u8,
    conn: u64,
}

struct SeqStatus {
    id: u64,
    conn: u64,
    waits: Vec<SeqWait>,
    flushed: bool,
}

/// Remote handle flipping the server out of its run loop (the SIGINT
/// thread uses this).
#[derive(Clone)]
pub struct StopHandle {
    running: Arc<AtomicBool>,
    wake: Arc<EventFd>,
}

impl StopHandle {
    pub fn stop(&self) {
        self.running.store(false, Ordering::Relaxed);
        self.wake.notify();
    }
}

pub struct Server {
    conf: Config,
    iface: CtrlIface,
    /// Start time in ms; clients use it to detect a server restart.
    id: u64,
    listener: TcpListener,
    conns: HashMap<u64, Conn>,
    next_conn: u64,
    running: Arc<AtomicBool>,
    wake: Arc<EventFd>,
    seq_status: Vec<SeqStatus>,
    ttl_names: NamesConfig,
    dds_names: NamesConfig,
    // Side channels out of the frontend callbacks, drained after every
    // run_frontend (the callbacks cannot borrow the server).
    seq_events: Rc<RefCell<Vec<SeqEvent>>>,
    outbox: Rc<RefCell<Vec<(u64, Vec<u8>)>>>,
}

fn server_id() -> u64 {
    match SystemTime::now().duration_since(UNIX_EPOCH) {
        Ok(epoch) => epoch.as_millis() as u64,
        Err(_) => 0,
    }
}

impl Server {
    pub fn new(conf: Config) -> anyhow::Result<Server> {
        let iface = controller::create(conf.dummy, conf.timing())
            .context("cannot start the controller")?;
        std::fs::create_dir_all(&conf.runtime_dir).with_context(|| {
            format!("cannot create runtime dir {}", conf.runtime_dir.display())
        })?;
        let listener = TcpListener::bind(&conf.listen)
            .with_context(|| format!("cannot bind {}", conf.listen))?;
        listener.set_nonblocking(true)?;
        let id = server_id();
        let ttl_names = NamesConfig::load(conf.runtime_dir.join("ttl.yaml"), NTTL);
        let dds_names = NamesConfig::load(conf.runtime_dir.join("dds.yaml"), NDDS);
        log::info!("server {} listening on {}", id, conf.listen);
        Ok(Server {
            conf,
            iface,
            id,
            listener,
            conns: HashMap::new(),
            next_conn: 1,
            running: Arc::new(AtomicBool::new(false)),
            wake: Arc::new(EventFd::new()?),
            seq_status: Vec::new(),
            ttl_names,
            dds_names,
            seq_events: Rc::new(RefCell::new(Vec::new())),
            outbox: Rc::new(RefCell::new(Vec::new())),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.listener.local_addr().unwrap()
    }

    pub fn stop_handle(&self) -> StopHandle {
        StopHandle {
            running: Arc::clone(&self.running),
            wake: Arc::clone(&self.wake),
        }
    }

    fn startup_bin(&self) -> PathBuf {
        self.conf.runtime_dir.join("startup.cmdbin")
    }

    fn startup_src(&self) -> PathBuf {
        self.conf.runtime_dir.join("startup.cmd")
    }

    fn run_startup(&mut self) {
        let startup = match Startup::load(&self.startup_bin()) {
            Ok(Some(startup)) => startup,
            Ok(None) => return,
            Err(err) => {
                log::error!("cannot load the startup sequence: {}", err);
                return;
            }
        };
        log::info!("running the startup sequence ({} bytes)", startup.code.len());
        let notify = Box::new(|ev: SeqEvent| match ev {
            SeqEvent::End(_) => log::info!("startup sequence finished"),
            SeqEvent::Cancel(_) => log::warn!("startup sequence cancelled"),
            _ => {}
        });
        if let Err(err) = self.iface.run_code(
            true,
            1,
            startup.len_ns,
            startup.ttl_mask,
            startup.code.into(),
            notify,
        ) {
            log::error!("cannot run the startup sequence: {}", err);
        }
    }

    pub fn run(&mut self) -> anyhow::Result<()> {
        self.running.store(true, Ordering::Relaxed);
        self.run_startup();
        while self.running.load(Ordering::Relaxed) {
            self.pump_frontend();
            self.flush_all();

            let mut fds = vec![
                evt::pollfd(self.listener.as_raw_fd(), libc::POLLIN),
                evt::pollfd(self.iface.backend_fd(), libc::POLLIN),
                evt::pollfd(self.wake.fd(), libc::POLLIN),
            ];
            let mut ids = Vec::with_capacity(self.conns.len());
            for (&id, conn) in self.conns.iter() {
                let mut events = libc::POLLIN;
                if !conn.wr.is_empty() {
                    events |= libc::POLLOUT;
                }
                fds.push(evt::pollfd(conn.stream.as_raw_fd(), events));
                ids.push(id);
            }
            evt::poll(&mut fds, POLL_TIMEOUT_MS)?;

            if fds[2].revents != 0 {
                self.wake.drain();
            }
            if fds[0].revents != 0 {
                self.accept_new();
            }
            // The backend event fd is drained inside run_frontend on the
            // next loop turn.
            let mut dead = Vec::new();
            for (idx, &id) in ids.iter().enumerate() {
                let revents = fds[3 + idx].revents;
                if revents == 0 {
                    continue;
                }
                let mut alive = true;
                if revents & (libc::POLLERR | libc::POLLHUP) != 0 {
                    alive = false;
                }
                if alive && revents & libc::POLLIN != 0 {
                    alive = self.service_read(id);
                }
                if alive && revents & libc::POLLOUT != 0 {
                    alive = self.flush_conn(id);
                }
                if !alive {
                    dead.push(id);
                }
            }
            for id in dead {
                self.drop_conn(id);
            }
        }
        // Final drain so already-finished sequences still notify.
        self.pump_frontend();
        self.flush_all();
        log::info!("server stopped");
        Ok(())
    }

    fn pump_frontend(&mut self) {
        self.iface.run_frontend();
        let events: Vec<SeqEvent> = self.seq_events.borrow_mut().drain(..).collect();
        for ev in events {
            self.handle_seq_event(ev);
        }
        let replies: Vec<(u64, Vec<u8>)> = self.outbox.borrow_mut().drain(..).collect();
        for (conn, buf) in replies {
            self.queue_raw(conn, buf);
        }
    }

    fn accept_new(&mut self) {
        loop {
            match self.listener.accept() {
                Ok((stream, peer)) => {
                    if let Err(err) = stream.set_nonblocking(true) {
                        log::error!("cannot set up connection from {}: {}", peer, err);
                        continue;
                    }
                    let _ = stream.set_nodelay(true);
                    let id = self.next_conn;
                    self.next_conn += 1;
                    log::debug!("connection {} from {}", id, peer);
                    self.conns.insert(
                        id,
                        Conn {
                            stream,
                            rd: FrameReader::new(),
                            wr: Vec::new(),
                        },
                    );
                }
                Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => break,
                Err(err) => {
                    log::error!("accept failed: {}", err);
                    break;
                }
            }
        }
    }

    fn drop_conn(&mut self, id: u64) {
        log::debug!("connection {} closed", id);
        self.conns.remove(&id);
        for status in self.seq_status.iter_mut() {
            status.waits.retain(|wait| wait.conn != id);
        }
    }

    fn service_read(&mut self, id: u64) -> bool {
        let mut chunk = [0u8; 4096];
        loop {
            let conn = match self.conns.get_mut(&id) {
                Some(conn) => conn,
                None => return false,
            };
            match conn.stream.read(&mut chunk) {
                Ok(0) => return false,
                Ok(n) => conn.rd.feed(&chunk[..n]),
                Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => break,
                Err(err) => {
                    log::debug!("connection {}: {}", id, err);
                    return false;
                }
            }
        }
        loop {
            let msg = match self.conns.get_mut(&id) {
                Some(conn) => conn.rd.next(),
                None => return false,
            };
            match msg {
                Ok(Some(parts)) => self.dispatch(id, parts),
                Ok(None) => return true,
                Err(err) => {
                    log::debug!("connection {}: {}", id, err);
                    return false;
                }
            }
        }
    }

    fn queue_raw(&mut self, id: u64, buf: Vec<u8>) {
        if let Some(conn) = self.conns.get_mut(&id) {
            conn.wr.extend_from_slice(&buf);
        }
    }

    fn send_reply(&mut self, id: u64, parts: &[&[u8]]) {
        self.queue_raw(id, encode(parts));
    }

    fn send_error(&mut self, id: u64) {
        self.send_reply(id, &[&ERR_REPLY]);
    }

    fn flush_conn(&mut self, id: u64) -> bool {
        let conn = match self.conns.get_mut(&id) {
            Some(conn) => conn,
            None => return false,
        };
        while !conn.wr.is_empty() {
            match conn.stream.write(&conn.wr) {
                Ok(0) => return false,
                Ok(n) => {
                    conn.wr.drain(..n);
                }
                Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => break,
                Err(err) => {
                    log::debug!("connection {}: {}", id, err);
                    return false;
                }
            }
        }
        true
    }

    fn flush_all(&mut self) {
        let ids: Vec<u64> = self.conns.keys().copied().collect();
        for id in ids {
            if !self.flush_conn(id) {
                self.drop_conn(id);
            }
        }
    }

    //////////////////////////////// SEQUENCE EVENTS

    fn seq_reply(&mut self, id: u64) -> [u8; 18] {
        let mut reply = [0u8; 18];
        LittleEndian::write_u64(&mut reply[0..8], id);
        LittleEndian::write_u64(&mut reply[8..16], self.id);
        reply[16] = self.iface.has_ttl_ovr() as u8;
        reply[17] = self.iface.has_dds_ovr() as u8;
        reply
    }

    fn handle_seq_event(&mut self, ev: SeqEvent) {
        let id = ev.id();
        let idx = match self.seq_status.iter().position(|status| status.id == id) {
            Some(idx) => idx,
            None => return, // startup sequence, or the client vanished
        };
        let submitter = self.seq_status[idx].conn;
        let reply = self.seq_reply(id);
        self.send_reply(submitter, &[&reply]);
        match ev {
            SeqEvent::Start(_) => {}
            SeqEvent::Flushed(_) => {
                let status = &mut self.seq_status[idx];
                status.flushed = true;
                let mut ready = Vec::new();
                let mut kept = Vec::new();
                for wait in status.waits.drain(..) {
                    if wait.what == 0 {
                        ready.push(wait.conn);
                    } else {
                        kept.push(wait);
                    }
                }
                status.waits = kept;
                for conn in ready {
                    self.send_reply(conn, &[&[0u8]]);
                }
            }
            SeqEvent::End(_) | SeqEvent::Cancel(_) => {
                let cancelled = matches!(ev, SeqEvent::Cancel(_)) as u8;
                let status = self.seq_status.remove(idx);
                for wait in status.waits {
                    self.send_reply(wait.conn, &[&[cancelled]]);
                }
            }
        }
    }

    //////////////////////////////// REQUESTS

    fn dispatch(&mut self, conn: u64, parts: Vec<Vec<u8>>) {
        let verb = match parts.first().map(|part| std::str::from_utf8(part)) {
            Some(Ok(verb)) => verb.to_owned(),
            _ => {
                self.send_error(conn);
                return;
            }
        };
        let payload = parts.get(1).map(|part| part.as_slice()).unwrap_or(&[]);
        log::debug!("connection {}: {}", conn, verb);
        match verb.as_str() {
            "run_seq" => self.req_run_code(conn, payload, false),
            "run_cmdlist" => self.req_run_code(conn, payload, true),
            "wait_seq" => self.req_wait_seq(conn, payload),
            "cancel_seq" => self.req_cancel_seq(conn, payload),
            "state_id" => self.req_state_id(conn),
            "override_ttl" => self.req_override_ttl(conn, payload),
            "set_ttl" => self.req_set_ttl(conn, payload),
            "override_dds" => self.req_set_dds(conn, payload, true),
            "set_dds" => self.req_set_dds(conn, payload, false),
            "get_override_dds" => self.req_get_override_dds(conn, payload),
            "get_dds" => self.req_get_dds(conn, payload),
            "reset_dds" => self.req_reset_dds(conn, payload),
            "set_clock" => self.req_set_clock(conn, payload),
            "get_clock" => {
                let clock = self.iface.clock();
                self.send_reply(conn, &[&[clock]]);
            }
            "get_ttl_names" => self.req_get_names(conn, false),
            "set_ttl_names" => self.req_set_names(conn, payload, false),
            "get_dds_names" => self.req_get_names(conn, true),
            "set_dds_names" => self.req_set_names(conn, payload, true),
            "get_startup" => self.req_get_startup(conn),
            "set_startup" => self.req_set_startup(conn, payload),
            _ => {
                log::debug!("connection {}: unknown request {}", conn, verb);
                self.send_error(conn);
            }
        }
    }

    fn req_run_code(&mut self, conn: u64, payload: &[u8], is_cmd: bool) {
        if payload.len() < 16 {
            self.send_error(conn);
            return;
        }
        let ver = LittleEndian::read_u32(&payload[0..4]);
        let len_ns = LittleEndian::read_u64(&payload[4..12]);
        let ttl_mask = LittleEndian::read_u32(&payload[12..16]);
        let code: Arc<[u8]> = payload[16..].into();
        let events = Rc::clone(&self.seq_events);
        let notify = Box::new(move |ev: SeqEvent| events.borrow_mut().push(ev));
        match self
            .iface
            .run_code(is_cmd, ver, len_ns, ttl_mask, code, notify)
        {
            Ok(id) => {
                // The 18-byte reply goes out at start, flushed and end.
                self.seq_status.push(SeqStatus {
                    id,
                    conn,
                    waits: Vec::new(),
                    flushed: false,
                });
            }
            Err(err) => {
                log::debug!("connection {}: {}", conn, err);
                self.send_error(conn);
            }
        }
    }

    fn req_wait_seq(&mut self, conn: u64, payload: &[u8]) {
        if payload.len() != 17 {
            self.send_error(conn);
            return;
        }
        let id = LittleEndian::read_u64(&payload[0..8]);
        let sid = LittleEndian::read_u64(&payload[8..16]);
        let what = payload[16];
        if sid != self.id || what > 1 {
            self.send_error(conn);
            return;
        }
        match self.seq_status.iter_mut().find(|status| status.id == id) {
            Some(status) => {
                if what == 0 && status.flushed {
                    self.send_reply(conn, &[&[0u8]]);
                } else {
                    status.waits.push(SeqWait { what, conn });
                }
            }
            // Already finished (or never seen); nothing to wait for.
            None => self.send_reply(conn, &[&[0u8]]),
        }
    }

    fn req_cancel_seq(&mut self, conn: u64, payload: &[u8]) {
        let id = match payload.len() {
            0 => 0,
            16 => {
                let sid = LittleEndian::read_u64(&payload[8..16]);
                if sid != self.id {
                    self.send_error(conn);
                    return;
                }
                LittleEndian::read_u64(&payload[0..8])
            }
            _ => {
                self.send_error(conn);
                return;
            }
        };
        let any = self.iface.cancel_seq(id);
        self.send_reply(conn, &[&[any as u8]]);
    }

    fn req_state_id(&mut self, conn: u64) {
        let mut reply = [0u8; 16];
        LittleEndian::write_u64(&mut reply[0..8], self.iface.get_state_id());
        LittleEndian::write_u64(&mut reply[8..16], self.id);
        self.send_reply(conn, &[&reply]);
    }

    fn req_override_ttl(&mut self, conn: u64, payload: &[u8]) {
        if payload.len() != 12 {
            self.send_error(conn);
            return;
        }
        let hi = LittleEndian::read_u32(&payload[0..4]);
        let lo = LittleEndian::read_u32(&payload[4..8]);
        let norm = LittleEndian::read_u32(&payload[8..12]);
        let (mut cur_lo, mut cur_hi) = self.iface.ttl_ovr_masks();
        if hi | lo | norm != 0 {
            cur_lo = (cur_lo | lo) & !(hi | norm);
            cur_hi = (cur_hi | hi) & !(lo | norm);
            self.iface.set_ttl_ovr_masks(cur_lo, cur_hi);
        }
        let mut reply = [0u8; 8];
        LittleEndian::write_u32(&mut reply[0..4], cur_lo);
        LittleEndian::write_u32(&mut reply[4..8], cur_hi);
        self.send_reply(conn, &[&reply]);
    }

    fn req_set_ttl(&mut self, conn: u64, payload: &[u8]) {
        if payload.len() != 8 {
            self.send_error(conn);
            return;
        }
        let clear = LittleEndian::read_u32(&payload[0..4]);
        let set = LittleEndian::read_u32(&payload[4..8]);
        let word = (self.iface.ttl_word() & !clear) | set;
        self.iface.set_ttl_word(word);
        let mut reply = [0u8; 4];
        LittleEndian::write_u32(&mut reply, word);
        self.send_reply(conn, &[&reply]);
    }

    fn req_set_dds(&mut self, conn: u64, payload: &[u8], is_ovr: bool) {
        if payload.len() % 5 != 0 {
            self.send_error(conn);
            return;
        }
        let mut sets = Vec::with_capacity(payload.len() / 5);
        for group in payload.chunks_exact(5) {
            match unpack_dds_addr(group[0]) {
                Some((typ, chn)) => sets.push((typ, chn, LittleEndian::read_u32(&group[1..5]))),
                None => {
                    self.send_error(conn);
                    return;
                }
            }
        }
        for (typ, chn, val) in sets {
            if is_ovr {
                self.iface.set_dds_ovr(typ, chn, val);
            } else {
                self.iface.set_dds(typ, chn, val);
            }
        }
        self.send_reply(conn, &[&[1u8]]);
    }

    fn parse_dds_addrs(&self, payload: &[u8]) -> Option<Vec<(DdsType, u8)>> {
        payload.iter().map(|&byte| unpack_dds_addr(byte)).collect()
    }

    fn req_get_override_dds(&mut self, conn: u64, payload: &[u8]) {
        let explicit = !payload.is_empty();
        let addrs = match self.parse_dds_addrs(payload) {
            Some(addrs) if explicit => addrs,
            Some(_) => {
                let mut addrs = Vec::new();
                for chn in 0..NDDS as u8 {
                    for typ in [DdsType::Freq, DdsType::Amp, DdsType::Phase] {
                        addrs.push((typ, chn));
                    }
                }
                addrs
            }
            None => {
                self.send_error(conn);
                return;
            }
        };
        // Override reads are answered synchronously from the cache.
        let out = Rc::new(RefCell::new(Vec::new()));
        for (typ, chn) in addrs {
            let out = Rc::clone(&out);
            self.iface.get_dds_ovr(
                typ,
                chn,
                Box::new(move |val| out.borrow_mut().push((pack_dds_addr(typ, chn), val))),
            );
        }
        let mut pairs = out.borrow_mut().split_off(0);
        if !explicit {
            // Unqueried: only report the overrides that are set.
            pairs.retain(|&(_, val)| val != crate::api::OVR_OFF);
        }
        self.send_reply(conn, &[&encode_dds_pairs(&pairs)]);
    }

    fn req_get_dds(&mut self, conn: u64, payload: &[u8]) {
        let addrs = if payload.is_empty() {
            let mut addrs = Vec::new();
            for chn in self.iface.get_active_dds() {
                for typ in [DdsType::Freq, DdsType::Amp, DdsType::Phase] {
                    addrs.push((typ, chn));
                }
            }
            addrs
        } else {
            match self.parse_dds_addrs(payload) {
                Some(addrs) => addrs,
                None => {
                    self.send_error(conn);
                    return;
                }
            }
        };
        if addrs.is_empty() {
            self.send_reply(conn, &[b"".as_slice()]);
            return;
        }
        let state = Rc::new(RefCell::new((addrs.len(), Vec::new())));
        for (typ, chn) in addrs {
            let state = Rc::clone(&state);
            let outbox = Rc::clone(&self.outbox);
            self.iface.get_dds(
                typ,
                chn,
                Box::new(move |val| {
                    let mut state = state.borrow_mut();
                    state.1.push((pack_dds_addr(typ, chn), val));
                    state.0 -= 1;
                    if state.0 == 0 {
                        let reply = encode(&[&encode_dds_pairs(&state.1)]);
                        outbox.borrow_mut().push((conn, reply));
                    }
                }),
            );
        }
    }

    fn req_reset_dds(&mut self, conn: u64, payload: &[u8]) {
        if payload.len() != 1 || payload[0] as usize >= NDDS {
            self.send_error(conn);
            return;
        }
        self.iface.reset_dds(payload[0]);
        self.send_reply(conn, &[&[1u8]]);
    }

    fn req_set_clock(&mut self, conn: u64, payload: &[u8]) {
        if payload.len() != 1 {
            self.send_error(conn);
            return;
        }
        self.iface.set_clock(payload[0]);
        self.send_reply(conn, &[&[1u8]]);
    }

    fn req_get_names(&mut self, conn: u64, dds: bool) {
        let names = if dds { &self.dds_names } else { &self.ttl_names };
        let mut reply = Vec::new();
        for (chn, name) in names.all().iter().enumerate() {
            if name.is_empty() {
                continue;
            }
            reply.push(chn as u8);
            reply.extend_from_slice(name.as_bytes());
            reply.push(0);
        }
        self.send_reply(conn, &[&reply]);
    }

    fn req_set_names(&mut self, conn: u64, payload: &[u8], dds: bool) {
        let mut updates = Vec::new();
        let mut rest = payload;
        while !rest.is_empty() {
            let chn = rest[0];
            let name_end = match rest[1..].iter().position(|&byte| byte == 0) {
                Some(pos) => 1 + pos,
                None => {
                    self.send_error(conn);
                    return;
                }
            };
            let name = match std::str::from_utf8(&rest[1..name_end]) {
                Ok(name) => name,
                Err(_) => {
                    self.send_error(conn);
                    return;
                }
            };
            updates.push((chn as usize, name.to_owned()));
            rest = &rest[name_end + 1..];
        }
        let names = if dds {
            &mut self.dds_names
        } else {
            &mut self.ttl_names
        };
        for (chn, name) in &updates {
            if !names.set(*chn, name) {
                self.send_error(conn);
                return;
            }
        }
        if !updates.is_empty() {
            names.save();
        }
        self.send_reply(conn, &[&[1u8]]);
    }

    fn req_get_startup(&mut self, conn: u64) {
        let mut source = std::fs::read(self.startup_src()).unwrap_or_default();
        source.push(0);
        self.send_reply(conn, &[&source]);
    }

    fn req_set_startup(&mut self, conn: u64, payload: &[u8]) {
        let text = match payload.iter().position(|&byte| byte == 0) {
            Some(pos) => &payload[..pos],
            None => payload,
        };
        let source = match std::str::from_utf8(text) {
            Ok(source) => source,
            Err(_) => {
                self.send_error(conn);
                return;
            }
        };
        let (code, ttl_mask) = match cmdlist::parse(source) {
            Ok(parsed) => parsed,
            Err(err) => {
                let mut reply = Vec::with_capacity(13 + err.msg.len());
                reply.push(1u8);
                reply.extend_from_slice(&(err.line as u32).to_le_bytes());
                reply.extend_from_slice(&(err.col_start as u32).to_le_bytes());
                reply.extend_from_slice(&(err.col_end as u32).to_le_bytes());
                reply.extend_from_slice(err.msg.as_bytes());
                self.send_reply(conn, &[&reply]);
                return;
            }
        };
        let cycles = cmdlist::total_time(&code).unwrap_or(0);
        let startup = Startup {
            len_ns: cycles * 10,
            ttl_mask,
            code,
        };
        if let Err(err) = startup.save(&self.startup_bin()) {
            log::error!("cannot save the startup sequence: {}", err);
            self.send_error(conn);
            return;
        }
        if let Err(err) = std::fs::write(self.startup_src(), source) {
            log::error!("cannot save the startup source: {}", err);
        }
        self.send_reply(conn, &[&[0u8]]);
    }
}

fn encode_dds_pairs(pairs: &[(u8, u32)]) -> Vec<u8> {
    let mut out = Vec::with_capacity(pairs.len() * 5);
    for &(addr, val) in pairs {
        out.push(addr);
        out.extend_from_slice(&val.to_le_bytes());
    }
    out
}
