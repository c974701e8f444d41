//! Service daemon for mDNS Service Discovery.

// How DNS-based Service Discovery works in a nutshell:
//
// (excerpt from RFC 6763)
// .... that a particular service instance can be
//    described using a DNS SRV [RFC2782] and DNS TXT [RFC1035] record.
//    The SRV record has a name of the form "<Instance>.<Service>.<Domain>"
//    and gives the target host and port where the service instance can be
//    reached.  The DNS TXT record of the same name gives additional
//    information about this instance, in a structured form using key/value
//    pairs, described in Section 6.  A client discovers the list of
//    available instances of a given service type using a query for a DNS
//    PTR [RFC1035] record with a name of the form "<Service>.<Domain>",
//    which returns a set of zero or more names, which are the names of the
//    aforementioned DNS SRV/TXT record pairs.
//
// Some naming conventions in this source code:
//
// `ty_domain` refers to service type together with domain name, i.e. <service>.<domain>.
// Every <service> consists of two labels: service itself and "_udp." or "_tcp".
// See RFC 6763 section 7 Service Names.
//     for example: `_my-service._udp.local.`
//
// `fullname` refers to a full Service Instance Name, i.e. <instance>.<service>.<domain>
//     for example: `my_home._my-service._udp.local.`
//
// In mDNS and DNS, the basic data structure is "Resource Record" (RR), where
// in Service Discovery, the basic data structure is "Service Info". One Service Info
// corresponds to a set of DNS Resource Records.
//
// A published entity walks through a fixed lifecycle, driven by tasks on
// the daemon's timer:
//
//   PROBING_1..3  ->  ANNOUNCING_1..2  ->  ANNOUNCED  ->  CANCELED
//
// Probes ask whether a peer already claims a record we intend to publish;
// announcements are unsolicited responses publishing the claimed records;
// a renewer re-announces them while they stay published; a goodbye (TTL 0)
// retracts them on unregister.
#[cfg(feature = "logging")]
use crate::log::{debug, trace};
use crate::{
    dns_cache::DnsCache,
    dns_parser::{
        current_time_millis, ip_address_rr_type, DnsAddress, DnsIncoming, DnsOutgoing, DnsPointer,
        DnsRecordBox, DnsRecordExt, DnsSrv, DnsTxt, RRType, CLASS_CACHE_FLUSH, CLASS_IN, FLAGS_AA,
        FLAGS_QR_QUERY, FLAGS_QR_RESPONSE, MAX_MSG_ABSOLUTE,
    },
    error::{Error, Result},
    service_info::{valid_ip_on_intf, ServiceInfo, ServiceState},
    Receiver,
};
use flume::{bounded, Sender, TrySendError};
use if_addrs::{IfAddr, Interface};
use mio::{net::UdpSocket as MioUdpSocket, Poll};
use socket2::Socket;
use std::{
    cmp::{self, Reverse},
    collections::{hash_map::Entry, BinaryHeap, HashMap, HashSet},
    fmt,
    net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV4, SocketAddrV6, UdpSocket},
    thread,
    time::Duration,
};

/// A simple macro to report all kinds of errors.
macro_rules! e_fmt {
  ($($arg:tt)+) => {
      Error::Msg(format!($($arg)+))
  };
}

/// The default max length of the service name without domain, not including the
/// leading underscore (`_`). It is set to 15 per
/// [RFC 6763 section 7.2](https://www.rfc-editor.org/rfc/rfc6763#section-7.2).
pub const SERVICE_NAME_LEN_MAX_DEFAULT: u8 = 15;

/// The default timeout for [ServiceDaemon::get_service_info], in millis.
pub const GET_INFO_TIMEOUT_DEFAULT_MILLIS: u64 = 3000;

const MDNS_PORT: u16 = 5353;
const GROUP_ADDR_V4: Ipv4Addr = Ipv4Addr::new(224, 0, 0, 251);
const GROUP_ADDR_V6: Ipv6Addr = Ipv6Addr::new(0xff02, 0, 0, 0, 0, 0, 0, 0xfb);
const LOOPBACK_V4: Ipv4Addr = Ipv4Addr::new(127, 0, 0, 1);

/// Special meta-query for service type enumeration.
/// See https://datatracker.ietf.org/doc/html/rfc6763#section-9
const META_QUERY: &str = "_services._dns-sd._udp.local.";

/// Registrations under the reverse domain are dropped silently.
const REVERSE_DOMAIN_SUFFIX: &str = ".in-addr.arpa.";

// Timings of the periodic jobs. Probing, announcing and goodbye
// retransmissions follow RFC 6762 sections 8.1, 8.3 and 10.1.
const PROBE_TICKS: u8 = 3;
const PROBE_INTERVAL_MILLIS: u64 = 250;
const PROBE_THROTTLE_LIMIT: u32 = 10;
const PROBE_THROTTLE_WINDOW_MILLIS: u64 = 1000;
const PROBE_THROTTLE_DELAY_MILLIS: u64 = 5000;
const ANNOUNCE_DELAY_MILLIS: u64 = 1000;
const ANNOUNCE_TICKS: u8 = 2;
const ANNOUNCE_INTERVAL_MILLIS: u64 = 250;
const RENEWAL_PERCENTS: [u32; 4] = [80, 85, 90, 95];
const REAPER_INTERVAL_MILLIS: u64 = 10_000;
const RESPONDER_DELAY_MIN_MILLIS: u64 = 20;
const RESPONDER_DELAY_MAX_MILLIS: u64 = 120;
const RESOLVER_INITIAL_DELAY_MILLIS: u64 = 225;
const RESOLVER_MAX_DELAY_MILLIS: u64 = 20_000;
/// A resolver without waiting callers gives up once its backoff delay
/// reaches this value (i.e. after its fourth round of queries).
const RESOLVER_IDLE_MAX_DELAY_MILLIS: u64 = 1800;
const GOODBYE_TICKS: u8 = 3;
const GOODBYE_INTERVAL_MILLIS: u64 = 125;
const LIST_GRACE_MILLIS: u64 = 200;
const IP_CHECK_INTERVAL_MILLIS: u64 = 30_000;

/// Response status code for the service `unregister` call.
#[derive(Debug)]
pub enum UnregisterStatus {
    /// Unregister was successful.
    OK,
    /// The service was not found in the registration.
    NotFound,
}

/// Status code for the service daemon.
#[derive(Debug, PartialEq, Clone, Eq)]
#[non_exhaustive]
pub enum DaemonStatus {
    /// The daemon is running as normal.
    Running,

    /// The daemon has been shutdown.
    Shutdown,
}

/// Different counters included in the metrics.
/// Currently all counters are for outgoing packets.
#[derive(Hash, Eq, PartialEq)]
enum Counter {
    Register,
    Probe,
    Announce,
    Renew,
    Unregister,
    GoodbyeResend,
    Browse,
    TypeBrowse,
    Respond,
    ResolveQuery,
    CacheReap,
    KnownAnswerSuppression,
}

impl fmt::Display for Counter {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::Register => write!(f, "register"),
            Self::Probe => write!(f, "probe"),
            Self::Announce => write!(f, "announce"),
            Self::Renew => write!(f, "renew"),
            Self::Unregister => write!(f, "unregister"),
            Self::GoodbyeResend => write!(f, "goodbye-resend"),
            Self::Browse => write!(f, "browse"),
            Self::TypeBrowse => write!(f, "type-browse"),
            Self::Respond => write!(f, "respond"),
            Self::ResolveQuery => write!(f, "resolve-query"),
            Self::CacheReap => write!(f, "cache-reap"),
            Self::KnownAnswerSuppression => write!(f, "known-answer-suppression"),
        }
    }
}

/// The metrics is a HashMap of (name_key, i64_value).
/// The main purpose is to help monitoring the mDNS packet traffic.
pub type Metrics = HashMap<String, i64>;

const SIGNAL_SOCK_EVENT_KEY: usize = usize::MAX - 1; // avoid overlap with poll ids

/// A daemon thread for mDNS
///
/// This struct provides a handle and an API to the daemon. It is cloneable.
#[derive(Clone)]
pub struct ServiceDaemon {
    /// Sender handle of the channel to the daemon.
    sender: Sender<Command>,

    /// Send to this addr to signal that a `Command` is coming.
    ///
    /// The daemon listens on this addr together with other mDNS sockets,
    /// to avoid busy polling the flume channel.
    signal_addr: SocketAddr,
}

impl ServiceDaemon {
    /// Creates a new daemon and spawns a thread to run the daemon.
    ///
    /// The daemon (re)uses the default mDNS port 5353. To keep it simple, we don't
    /// ask callers to set the port.
    pub fn new() -> Result<Self> {
        // Use port 0 to allow the system assign a random available port,
        // no need for a pre-defined port number.
        let signal_addr = SocketAddrV4::new(LOOPBACK_V4, 0);

        let signal_sock = UdpSocket::bind(signal_addr)
            .map_err(|e| e_fmt!("failed to create signal_sock for daemon: {}", e))?;

        // Get the socket with the OS chosen port
        let signal_addr = signal_sock
            .local_addr()
            .map_err(|e| e_fmt!("failed to get signal sock addr: {}", e))?;

        // Must be nonblocking so we can listen to it together with mDNS sockets.
        signal_sock
            .set_nonblocking(true)
            .map_err(|e| e_fmt!("failed to set nonblocking for signal socket: {}", e))?;

        let poller = Poll::new().map_err(|e| e_fmt!("failed to create mio Poll: {e}"))?;

        let (sender, receiver) = bounded(100);

        // Spawn the daemon thread
        let mio_sock = MioUdpSocket::from_std(signal_sock);
        thread::Builder::new()
            .name("mDNS_daemon".to_string())
            .spawn(move || Self::daemon_thread(mio_sock, poller, receiver))
            .map_err(|e| e_fmt!("thread builder failed to spawn: {}", e))?;

        Ok(Self {
            sender,
            signal_addr,
        })
    }

    /// Sends `cmd` to the daemon via its channel, and sends a signal
    /// to its sock addr to notify.
    fn send_cmd(&self, cmd: Command) -> Result<()> {
        let cmd_name = cmd.to_string();

        // First, send to the flume channel.
        self.sender.try_send(cmd).map_err(|e| match e {
            TrySendError::Full(_) => Error::Again,
            e => e_fmt!("flume::channel::send failed: {}", e),
        })?;

        // Second, send a signal to notify the daemon.
        let addr = SocketAddrV4::new(LOOPBACK_V4, 0);
        let socket = UdpSocket::bind(addr)
            .map_err(|e| e_fmt!("Failed to create socket to send signal: {}", e))?;
        socket
            .send_to(cmd_name.as_bytes(), self.signal_addr)
            .map_err(|e| {
                e_fmt!(
                    "signal socket send_to {} ({}) failed: {}",
                    self.signal_addr,
                    cmd_name,
                    e
                )
            })?;

        Ok(())
    }

    /// Starts browsing for a specific service type.
    ///
    /// `service_type` must end with a valid mDNS domain: '._tcp.local.' or '._udp.local.'
    ///
    /// Returns a channel `Receiver` to receive events about the service. The caller
    /// can call `.recv_async().await` on this receiver to handle events in an
    /// async environment or call `.recv()` in a sync environment.
    ///
    /// Cached service records are reported first, then live updates follow.
    /// When a new instance is found, the daemon automatically tries to
    /// resolve it, i.e. find its SRV, TXT and address records.
    pub fn browse(&self, service_type: &str) -> Result<Receiver<ServiceEvent>> {
        check_domain_suffix(service_type)?;

        let (resp_s, resp_r) = bounded(10);
        self.send_cmd(Command::Browse(service_type.to_string(), resp_s))?;
        Ok(resp_r)
    }

    /// Stops searching for a specific service type.
    ///
    /// When an error is returned, the caller should retry only when
    /// the error is `Error::Again`, otherwise should log and move on.
    pub fn stop_browse(&self, ty_domain: &str) -> Result<()> {
        self.send_cmd(Command::StopBrowse(ty_domain.to_string()))
    }

    /// Starts browsing for service *types* on the network.
    ///
    /// Every type already known to the daemon is reported once on the
    /// returned channel, followed by live updates as new types appear
    /// in `_services._dns-sd._udp.local.` enumeration answers.
    pub fn browse_types(&self) -> Result<Receiver<ServiceTypeEvent>> {
        let (resp_s, resp_r) = bounded(100);
        self.send_cmd(Command::BrowseTypes(resp_s))?;
        Ok(resp_r)
    }

    /// Registers a service provided by this host, and blocks until the
    /// service has been probed for conflicts and announced.
    ///
    /// If `service_info` has no addresses yet and its `addr_auto` is enabled,
    /// this method will automatically fill in addresses from the host.
    ///
    /// If a peer disputes a name we are probing for, the instance name is
    /// renamed (`"foo"` becomes `"foo (2)"`) and probing restarts; the
    /// call still returns once the renamed service is announced. The
    /// rename is reported via [ServiceDaemon::monitor].
    ///
    /// Registrations under the reverse domain `in-addr.arpa.` are
    /// silently dropped.
    ///
    /// To re-announce a service with an updated `service_info`, just call
    /// this `register` function again. No need to call `unregister` first.
    pub fn register(&self, service_info: ServiceInfo) -> Result<()> {
        if service_info.get_type().ends_with(REVERSE_DOMAIN_SUFFIX) {
            return Ok(());
        }
        check_service_name(service_info.get_fullname())?;
        check_hostname(service_info.get_hostname())?;

        let (resp_s, resp_r) = bounded(1);
        self.send_cmd(Command::Register(service_info, resp_s))?;
        resp_r
            .recv()
            .map_err(|e| e_fmt!("failed waiting for register to finish: {}", e))?
    }

    /// Unregisters a service. This is a graceful shutdown of a service.
    ///
    /// The call blocks until the goodbye (a response with TTL 0 for all
    /// of the service's records) and its retransmissions have been sent.
    pub fn unregister(&self, fullname: &str) -> Result<UnregisterStatus> {
        let (resp_s, resp_r) = bounded(1);
        self.send_cmd(Command::Unregister(fullname.to_lowercase(), resp_s))?;
        resp_r
            .recv()
            .map_err(|e| e_fmt!("failed waiting for unregister to finish: {}", e))
    }

    /// Unregisters all services registered with this daemon, blocking
    /// until their goodbyes have been sent.
    pub fn unregister_all(&self) -> Result<()> {
        let (resp_s, resp_r) = bounded(1);
        self.send_cmd(Command::UnregisterAll(resp_s))?;
        resp_r
            .recv()
            .map_err(|e| e_fmt!("failed waiting for unregister_all to finish: {}", e))
    }

    /// Resolves a service instance: blocks until the instance's SRV, TXT
    /// and address records are known, or `timeout_millis` elapsed.
    ///
    /// `instance_name` is the instance only, without the service type
    /// suffix. Returns `None` on timeout. Most callers pass
    /// [GET_INFO_TIMEOUT_DEFAULT_MILLIS].
    pub fn get_service_info(
        &self,
        ty_domain: &str,
        instance_name: &str,
        timeout_millis: u64,
    ) -> Result<Option<ServiceInfo>> {
        check_domain_suffix(ty_domain)?;

        let (resp_s, resp_r) = bounded(1);
        self.send_cmd(Command::GetServiceInfo(
            ty_domain.to_string(),
            instance_name.to_string(),
            timeout_millis,
            resp_s,
        ))?;
        resp_r
            .recv()
            .map_err(|e| e_fmt!("failed waiting for service info: {}", e))
    }

    /// Returns the currently known instances of `ty_domain`.
    ///
    /// The first call for a given type starts querying for it and blocks
    /// for a 200 ms grace window so that answers on the local network
    /// have a chance to arrive; subsequent calls return immediately from
    /// the cache. Returns an empty list if the daemon has shut down.
    pub fn list(&self, ty_domain: &str) -> Result<Vec<ServiceInfo>> {
        check_domain_suffix(ty_domain)?;

        let (resp_s, resp_r) = bounded(1);
        match self.send_cmd(Command::List(ty_domain.to_string(), resp_s)) {
            Ok(()) => {}
            Err(Error::Again) => return Err(Error::Again),
            Err(_) => return Ok(Vec::new()), // daemon already closed
        }
        Ok(resp_r.recv().unwrap_or_default())
    }

    /// Starts to monitor events from the daemon.
    ///
    /// Returns a channel [`Receiver`] of [`DaemonEvent`].
    pub fn monitor(&self) -> Result<Receiver<DaemonEvent>> {
        let (resp_s, resp_r) = bounded(100);
        self.send_cmd(Command::Monitor(resp_s))?;
        Ok(resp_r)
    }

    /// Returns a snapshot of the daemon's counters, e.g. how many probes,
    /// announcements and responses went out.
    pub fn get_metrics(&self) -> Result<Metrics> {
        let (resp_s, resp_r) = bounded(1);
        self.send_cmd(Command::GetMetrics(resp_s))?;
        resp_r
            .recv()
            .map_err(|e| e_fmt!("failed to get metrics: {}", e))
    }

    /// Returns the status of the daemon.
    pub fn status(&self) -> Result<DaemonStatus> {
        if self.sender.is_disconnected() {
            return Ok(DaemonStatus::Shutdown);
        }
        let (resp_s, resp_r) = bounded(1);
        self.send_cmd(Command::GetStatus(resp_s))?;
        resp_r
            .recv()
            .map_err(|e| e_fmt!("failed to get daemon status: {}", e))
    }

    /// Change the max length allowed for a service name.
    ///
    /// As RFC 6763 defines a length max for a service name, a user should not call
    /// this method unless they have to. See [`SERVICE_NAME_LEN_MAX_DEFAULT`].
    ///
    /// `len_max` is capped at an internal limit, which is currently 30.
    pub fn set_service_name_len_max(&self, len_max: u8) -> Result<()> {
        const SERVICE_NAME_LEN_MAX_LIMIT: u8 = 30; // Double the default length max.

        if len_max > SERVICE_NAME_LEN_MAX_LIMIT {
            return Err(e_fmt!("service name length max {} is too large", len_max));
        }

        self.send_cmd(Command::SetOption(DaemonOption::ServiceNameLenMax(len_max)))
    }

    /// Include interfaces that match `if_kind` for this service daemon.
    ///
    /// For example:
    /// ```ignore
    ///     daemon.enable_interface("en0")?;
    /// ```
    pub fn enable_interface(&self, if_kind: impl IntoIfKindVec) -> Result<()> {
        let if_kind_vec = if_kind.into_vec();
        self.send_cmd(Command::SetOption(DaemonOption::EnableInterface(
            if_kind_vec.kinds,
        )))
    }

    /// Ignore/exclude interfaces that match `if_kind` for this daemon.
    ///
    /// For example:
    /// ```ignore
    ///     daemon.disable_interface(IfKind::IPv6)?;
    /// ```
    pub fn disable_interface(&self, if_kind: impl IntoIfKindVec) -> Result<()> {
        let if_kind_vec = if_kind.into_vec();
        self.send_cmd(Command::SetOption(DaemonOption::DisableInterface(
            if_kind_vec.kinds,
        )))
    }

    /// Enable or disable the loopback for locally sent multicast packets in IPv4.
    ///
    /// By default, multicast loop is enabled for IPv4. When disabled, a querier will not
    /// receive announcements from a responder on the same host.
    pub fn set_multicast_loop_v4(&self, on: bool) -> Result<()> {
        self.send_cmd(Command::SetOption(DaemonOption::MulticastLoopV4(on)))
    }

    /// Enable or disable the loopback for locally sent multicast packets in IPv6.
    ///
    /// By default, multicast loop is enabled for IPv6. When disabled, a querier will not
    /// receive announcements from a responder on the same host.
    pub fn set_multicast_loop_v6(&self, on: bool) -> Result<()> {
        self.send_cmd(Command::SetOption(DaemonOption::MulticastLoopV6(on)))
    }

    /// Shuts down the daemon thread: all registered services send their
    /// goodbyes, then the thread exits.
    ///
    /// This call is idempotent: shutting down an already-closed daemon
    /// returns [DaemonStatus::Shutdown] without error.
    pub fn shutdown(&self) -> Result<DaemonStatus> {
        if self.sender.is_disconnected() {
            return Ok(DaemonStatus::Shutdown);
        }
        let (resp_s, resp_r) = bounded(1);
        match self.send_cmd(Command::Exit(resp_s)) {
            Ok(()) => Ok(resp_r.recv().unwrap_or(DaemonStatus::Shutdown)),
            Err(Error::Again) => Err(Error::Again),
            Err(_) => Ok(DaemonStatus::Shutdown),
        }
    }

    fn daemon_thread(signal_sock: MioUdpSocket, poller: Poll, receiver: Receiver<Command>) {
        let responder = Responder::new(signal_sock, poller);

        if let Some(cmd) = Self::run(responder, receiver) {
            match cmd {
                Command::Exit(resp_s) => {
                    if let Err(e) = resp_s.send(DaemonStatus::Shutdown) {
                        debug!("exit: failed to send response of shutdown: {}", e);
                    }
                }
                _ => {
                    debug!("Unexpected command: {:?}", cmd);
                }
            }
        }
    }

    fn handle_poller_events(zc: &mut Responder, events: &mio::Events) {
        for ev in events.iter() {
            trace!("event received with key {:?}", ev.token());
            if ev.token().0 == SIGNAL_SOCK_EVENT_KEY {
                // Drain signals as we will drain commands as well.
                zc.signal_sock_drain();

                if let Err(e) = zc.poller.registry().reregister(
                    &mut zc.signal_sock,
                    ev.token(),
                    mio::Interest::READABLE,
                ) {
                    debug!("failed to modify poller for signal socket: {}", e);
                }
                continue; // Next event.
            }

            // Read until no more packets available.
            let intf = match zc.poll_ids.get(&ev.token().0) {
                Some(interface) => interface.clone(),
                None => {
                    debug!("Interface for event key {} not found", ev.token().0);
                    continue;
                }
            };
            while zc.handle_read(&intf) {}

            // Continue to monitor this socket, unless its poll id was
            // dropped by a socket rebuild during the reads.
            if zc.poll_ids.contains_key(&ev.token().0) {
                if let Some(sock) = zc.intf_socks.get_mut(&intf) {
                    if let Err(e) =
                        zc.poller
                            .registry()
                            .reregister(sock, ev.token(), mio::Interest::READABLE)
                    {
                        debug!("modify poller for interface {:?}: {}", &intf, e);
                    }
                }
            }
        }
    }

    /// The main event loop of the daemon thread
    ///
    /// In each round, it will:
    /// 1. select the listening sockets with a timeout.
    /// 2. process the incoming packets if any.
    /// 3. try_recv on its channel and execute commands.
    /// 4. run any timer-driven tasks that came due.
    fn run(mut zc: Responder, receiver: Receiver<Command>) -> Option<Command> {
        // Add the daemon's signal socket to the poller.
        if let Err(e) = zc.poller.registry().register(
            &mut zc.signal_sock,
            mio::Token(SIGNAL_SOCK_EVENT_KEY),
            mio::Interest::READABLE,
        ) {
            debug!("failed to add signal socket to the poller: {}", e);
            return None;
        }

        // Add mDNS sockets to the poller.
        for (intf, sock) in zc.intf_socks.iter_mut() {
            let key =
                Responder::add_poll_impl(&mut zc.poll_ids, &mut zc.poll_id_count, intf.clone());

            if let Err(e) =
                zc.poller
                    .registry()
                    .register(sock, mio::Token(key), mio::Interest::READABLE)
            {
                debug!("add socket of {:?} to poller: {e}", intf);
                return None;
            }
        }

        // The recurring maintenance jobs.
        let now = current_time_millis();
        zc.schedule(now + REAPER_INTERVAL_MILLIS, 0, TaskKind::Reap);
        zc.schedule(now + IP_CHECK_INTERVAL_MILLIS, 0, TaskKind::IpCheck);

        // Start the run loop.

        let mut events = mio::Events::with_capacity(1024);
        loop {
            let now = current_time_millis();

            let earliest_timer = zc.peek_earliest_timer();
            let timeout = earliest_timer.map(|timer| {
                // If `timer` already passed, set `timeout` to be 1ms.
                let millis = if timer > now { timer - now } else { 1 };
                Duration::from_millis(millis)
            });

            // Process incoming packets, command events and optional timeout.
            events.clear();
            match zc.poller.poll(&mut events, timeout) {
                Ok(_) => Self::handle_poller_events(&mut zc, &events),
                Err(e) => debug!("failed to select from sockets: {}", e),
            }

            let now = current_time_millis();

            // Remove the timer if already passed.
            if let Some(timer) = earliest_timer {
                if now >= timer {
                    zc.pop_earliest_timer();
                }
            }

            // process commands from the command channel
            while let Ok(command) = receiver.try_recv() {
                if matches!(command, Command::Exit(_)) {
                    zc.send_goodbye_all();
                    zc.status = DaemonStatus::Shutdown;
                    return Some(command);
                }
                zc.exec_command(command);
            }

            // run the tasks whose time has come.
            zc.run_due_tasks();
        }
    }
}

/// Creates a new UDP socket that uses `intf` to send and recv multicast.
fn new_socket_bind(intf: &Interface, should_loop: bool) -> Result<MioUdpSocket> {
    // Use the same socket for receiving and sending multicast packets.
    // Such socket has to bind to INADDR_ANY or IN6ADDR_ANY.
    let intf_ip = &intf.ip();
    match intf_ip {
        IpAddr::V4(ip) => {
            let addr = SocketAddrV4::new(Ipv4Addr::new(0, 0, 0, 0), MDNS_PORT);
            let sock = new_socket(addr.into(), true)?;

            // Join mDNS group to receive packets.
            sock.join_multicast_v4(&GROUP_ADDR_V4, ip)
                .map_err(|e| e_fmt!("join multicast group on addr {}: {}", intf_ip, e))?;

            // Set IP_MULTICAST_IF to send packets.
            sock.set_multicast_if_v4(ip)
                .map_err(|e| e_fmt!("set multicast_if on addr {}: {}", ip, e))?;

            if !should_loop {
                sock.set_multicast_loop_v4(false)
                    .map_err(|e| e_fmt!("failed to set multicast loop v4 for {ip}: {e}"))?;
            }

            // Test if we can send packets successfully.
            let multicast_addr = SocketAddrV4::new(GROUP_ADDR_V4, MDNS_PORT).into();
            let test_packets = DnsOutgoing::new(0).to_data_on_wire();
            for packet in test_packets {
                sock.send_to(&packet, &multicast_addr)
                    .map_err(|e| e_fmt!("send multicast packet on addr {}: {}", ip, e))?;
            }
            Ok(MioUdpSocket::from_std(UdpSocket::from(sock)))
        }
        IpAddr::V6(ip) => {
            let addr = SocketAddrV6::new(Ipv6Addr::new(0, 0, 0, 0, 0, 0, 0, 0), MDNS_PORT, 0, 0);
            let sock = new_socket(addr.into(), true)?;

            // Join mDNS group to receive packets.
            sock.join_multicast_v6(&GROUP_ADDR_V6, intf.index.unwrap_or(0))
                .map_err(|e| e_fmt!("join multicast group on addr {}: {}", ip, e))?;

            // Set IPV6_MULTICAST_IF to send packets.
            sock.set_multicast_if_v6(intf.index.unwrap_or(0))
                .map_err(|e| e_fmt!("set multicast_if on addr {}: {}", ip, e))?;

            // We are not sending multicast packets to test this socket as there might
            // be many IPv6 interfaces on a host and could cause such send error:
            // "No buffer space available (os error 55)".

            Ok(MioUdpSocket::from_std(UdpSocket::from(sock)))
        }
    }
}

/// Creates a new UDP socket to bind to `addr` with REUSEPORT option.
/// `non_block` indicates whether to set O_NONBLOCK for the socket.
fn new_socket(addr: SocketAddr, non_block: bool) -> Result<Socket> {
    let domain = match addr {
        SocketAddr::V4(_) => socket2::Domain::IPV4,
        SocketAddr::V6(_) => socket2::Domain::IPV6,
    };

    let fd = Socket::new(domain, socket2::Type::DGRAM, None)
        .map_err(|e| e_fmt!("create socket failed: {}", e))?;

    fd.set_reuse_address(true)
        .map_err(|e| e_fmt!("set ReuseAddr failed: {}", e))?;
    #[cfg(unix)] // this is currently restricted to Unix's in socket2
    fd.set_reuse_port(true)
        .map_err(|e| e_fmt!("set ReusePort failed: {}", e))?;

    if non_block {
        fd.set_nonblocking(true)
            .map_err(|e| e_fmt!("set O_NONBLOCK: {}", e))?;
    }

    fd.bind(&addr.into())
        .map_err(|e| e_fmt!("socket bind to {} failed: {}", &addr, e))?;

    trace!("new socket bind to {}", &addr);
    Ok(fd)
}

/// Enum to represent the IP version.
#[derive(Debug, Eq, Hash, PartialEq)]
enum IpVersion {
    V4,
    V6,
}

/// A struct to track multicast send status for a network interface.
#[derive(Debug, Eq, Hash, PartialEq)]
struct MulticastSendTracker {
    intf_index: u32,
    ip_version: IpVersion,
}

/// Returns the multicast send tracker if the interface index is valid
fn multicast_send_tracker(intf: &Interface) -> Option<MulticastSendTracker> {
    match intf.index {
        Some(index) => {
            let ip_ver = match intf.addr {
                IfAddr::V4(_) => IpVersion::V4,
                IfAddr::V6(_) => IpVersion::V6,
            };
            Some(MulticastSendTracker {
                intf_index: index,
                ip_version: ip_ver,
            })
        }
        None => None,
    }
}

/// Specify kinds of interfaces. It is used to enable or to disable interfaces in the daemon.
///
/// Note that for ergonomic reasons, `From<&str>` and `From<IpAddr>` are implemented.
#[derive(Debug, Clone)]
#[non_exhaustive]
pub enum IfKind {
    /// All interfaces.
    All,

    /// All IPv4 interfaces.
    IPv4,

    /// All IPv6 interfaces.
    IPv6,

    /// By the interface name, for example "en0"
    Name(String),

    /// By an IPv4 or IPv6 address.
    Addr(IpAddr),
}

impl IfKind {
    /// Checks if `intf` matches with this interface kind.
    fn matches(&self, intf: &Interface) -> bool {
        match self {
            Self::All => true,
            Self::IPv4 => intf.ip().is_ipv4(),
            Self::IPv6 => intf.ip().is_ipv6(),
            Self::Name(ifname) => ifname == &intf.name,
            Self::Addr(addr) => addr == &intf.ip(),
        }
    }
}

/// The first use case of specifying an interface was to
/// use an interface name. Hence adding this for ergonomic reasons.
impl From<&str> for IfKind {
    fn from(val: &str) -> Self {
        Self::Name(val.to_string())
    }
}

impl From<&String> for IfKind {
    fn from(val: &String) -> Self {
        Self::Name(val.to_string())
    }
}

/// Still for ergonomic reasons.
impl From<IpAddr> for IfKind {
    fn from(val: IpAddr) -> Self {
        Self::Addr(val)
    }
}

/// A list of `IfKind` that can be used to match interfaces.
pub struct IfKindVec {
    kinds: Vec<IfKind>,
}

/// A trait that converts a type into a Vec of `IfKind`.
pub trait IntoIfKindVec {
    fn into_vec(self) -> IfKindVec;
}

impl<T: Into<IfKind>> IntoIfKindVec for T {
    fn into_vec(self) -> IfKindVec {
        let if_kind: IfKind = self.into();
        IfKindVec {
            kinds: vec![if_kind],
        }
    }
}

impl<T: Into<IfKind>> IntoIfKindVec for Vec<T> {
    fn into_vec(self) -> IfKindVec {
        let kinds: Vec<IfKind> = self.into_iter().map(|x| x.into()).collect();
        IfKindVec { kinds }
    }
}

/// Selection of interfaces.
struct IfSelection {
    /// The interfaces to be selected.
    if_kind: IfKind,

    /// Whether the `if_kind` should be enabled or not.
    selected: bool,
}

/// A timer-driven job. All periodic work of the daemon runs as tasks:
/// probers, announcers, renewers, responders, resolvers, the reaper and
/// the cancelers all share the one timer of the run loop.
struct Task {
    /// UNIX timestamp in millis at which the task is due.
    next_time: u64,

    /// For tasks bound to an entity (a service fullname): the slot
    /// generation this task belongs to. A task whose generation fell
    /// behind its entity's slot is obsolete and will not run. Zero for
    /// tasks that are not entity-bound.
    generation: u64,

    kind: TaskKind,
}

enum TaskKind {
    /// Sends a probe query asking whether a peer owns the records we
    /// intend to publish.
    Probe { fullname: String, tick: u8 },

    /// Sends an unsolicited response announcing the claimed records.
    Announce { fullname: String, tick: u8 },

    /// Re-announces published records at fractions of their TTL.
    Renew {
        fullname: String,
        tick: u8,
        cycle_start: u64,
    },

    /// Answers pending queries whose random delay has elapsed.
    Respond,

    /// Evicts expired records from the cache.
    Reap,

    /// Re-scans host interfaces.
    IpCheck,

    /// Queries for service types (`_services._dns-sd._udp.local.`).
    TypeResolve { delay: u64 },

    /// Queries PTR for a browsed service type.
    ServiceResolve { ty_domain: String, delay: u64 },

    /// Queries SRV/TXT/addresses for a service instance until it has data.
    InfoResolve { fullname: String, delay: u64 },

    /// Retransmits goodbye packets, then releases the unregister caller.
    Goodbye {
        packets: Vec<(Interface, Vec<u8>)>,
        tick: u8,
        reply: Option<Sender<UnregisterStatus>>,
        done: Option<Sender<()>>,
    },

    /// Replies to a `list()` caller after the first-browse grace window.
    ListReply {
        ty_domain: String,
        reply: Sender<Vec<ServiceInfo>>,
    },
}

/// Rate limit for outgoing probes, across all services.
///
/// The counter increments for every probe inside a one second window;
/// once it reaches the limit, the next probe is delayed by five seconds.
/// The counter resets when the window rolls over.
struct ProbeThrottle {
    count: u32,
    window_start: u64,
}

impl ProbeThrottle {
    fn new() -> Self {
        Self {
            count: 0,
            window_start: 0,
        }
    }

    /// Records one probe send. Returns true if the next probe must be
    /// delayed.
    fn record_probe(&mut self, now: u64) -> bool {
        if now >= self.window_start + PROBE_THROTTLE_WINDOW_MILLIS {
            self.window_start = now;
            self.count = 0;
        }
        self.count += 1;
        self.count >= PROBE_THROTTLE_LIMIT
    }
}

/// A locally registered service and its lifecycle state.
struct ServiceEntry {
    info: ServiceInfo,
    state: ServiceState,

    /// `register()` callers blocked until the service is announced.
    waiters: Vec<Sender<Result<()>>>,
}

/// A query waiting for its randomly delayed response.
///
/// A truncated query stays pending while continuations from the same
/// peer are merged into it; one responder drains the assembled query.
struct PendingResponse {
    msg: DnsIncoming,
    intf: Interface,
    peer: SocketAddr,
    due: u64,
}

/// An in-flight resolution of one service instance.
struct InfoResolver {
    ty_domain: String,
    fullname: String,

    /// Blocked `get_service_info` callers and their deadlines. May be
    /// empty for resolutions driven by browsing.
    waiters: Vec<(Sender<Option<ServiceInfo>>, u64)>,
}

/// The daemon state: all of it owned and mutated by the daemon thread
/// only. The receiver path and the public API feed it through parsed
/// frames and commands respectively.
struct Responder {
    /// Local interfaces with sockets to recv/send on these interfaces.
    intf_socks: HashMap<Interface, MioUdpSocket>,

    /// Map poll id to Interface.
    poll_ids: HashMap<usize, Interface>,

    /// Next poll id value
    poll_id_count: usize,

    /// Local registered services, keyed by lowercased service full names.
    my_services: HashMap<String, ServiceEntry>,

    /// Received DNS records.
    cache: DnsCache,

    /// Active "Browse" commands.
    service_queriers: HashMap<String, Sender<ServiceEvent>>, // <ty_domain, channel::sender>

    /// Active service-type listeners.
    type_listeners: Vec<Sender<ServiceTypeEvent>>,

    /// Service types known so far, lowercased key to original case.
    service_types: HashMap<String, String>,

    /// All pending timer-driven jobs.
    tasks: Vec<Task>,

    /// Per-entity task slots: installing a new task for an entity bumps
    /// its generation, cancelling whatever task was driving it before.
    task_slots: HashMap<String, u64>,

    /// Timestamps marking where we need another iteration of the run loop.
    ///
    /// When the run loop goes through a single iteration, it will
    /// set its timeout to the earliest timer in this list.
    timers: BinaryHeap<Reverse<u64>>,

    /// Queries waiting for their randomly delayed responder.
    pending_responses: Vec<PendingResponse>,

    /// In-flight instance resolutions, keyed by lowercased fullname.
    info_resolvers: HashMap<String, InfoResolver>,

    /// Types that `list()` has been called for.
    listed_types: HashSet<String>,

    /// Instances we have reported as resolved to at least one listener.
    resolved: HashSet<String>,

    throttle: ProbeThrottle,

    counters: Metrics,

    /// Waits for incoming packets.
    poller: Poll,

    /// Channels to notify events.
    monitors: Vec<Sender<DaemonEvent>>,

    /// Options
    service_name_len_max: u8,

    /// All interface selections called to the daemon.
    if_selections: Vec<IfSelection>,

    /// Socket for signaling.
    signal_sock: MioUdpSocket,

    status: DaemonStatus,

    multicast_loop_v4: bool,

    multicast_loop_v6: bool,
}

impl Responder {
    fn new(signal_sock: MioUdpSocket, poller: Poll) -> Self {
        // Get interfaces.
        let my_ifaddrs = my_ip_interfaces();

        // Create a socket for every IP addr.
        // Note: it is possible that `my_ifaddrs` contains the same IP addr with different interface names,
        // or the same interface name with different IP addrs.
        let mut intf_socks = HashMap::new();

        for intf in my_ifaddrs {
            let sock = match new_socket_bind(&intf, true) {
                Ok(s) => s,
                Err(e) => {
                    trace!("bind a socket to {}: {}. Skipped.", &intf.ip(), e);
                    continue;
                }
            };

            intf_socks.insert(intf, sock);
        }

        Self {
            intf_socks,
            poll_ids: HashMap::new(),
            poll_id_count: 0,
            my_services: HashMap::new(),
            cache: DnsCache::new(),
            service_queriers: HashMap::new(),
            type_listeners: Vec::new(),
            service_types: HashMap::new(),
            tasks: Vec::new(),
            task_slots: HashMap::new(),
            timers: BinaryHeap::new(),
            pending_responses: Vec::new(),
            info_resolvers: HashMap::new(),
            listed_types: HashSet::new(),
            resolved: HashSet::new(),
            throttle: ProbeThrottle::new(),
            counters: HashMap::new(),
            poller,
            monitors: Vec::new(),
            service_name_len_max: SERVICE_NAME_LEN_MAX_DEFAULT,
            if_selections: Vec::new(),
            signal_sock,
            status: DaemonStatus::Running,
            multicast_loop_v4: true,
            multicast_loop_v6: true,
        }
    }

    // ---- timers and the task queue ----

    fn add_timer(&mut self, next_time: u64) {
        self.timers.push(Reverse(next_time));
    }

    fn peek_earliest_timer(&self) -> Option<u64> {
        self.timers.peek().map(|Reverse(v)| *v)
    }

    fn pop_earliest_timer(&mut self) -> Option<u64> {
        self.timers.pop().map(|Reverse(v)| v)
    }

    fn schedule(&mut self, next_time: u64, generation: u64, kind: TaskKind) {
        self.tasks.push(Task {
            next_time,
            generation,
            kind,
        });
        self.add_timer(next_time);
    }

    /// Claims the task slot of `entity`: whatever task was installed for
    /// it before becomes obsolete. Returns the new generation.
    fn install_entity_task(&mut self, entity: &str) -> u64 {
        let count = self.task_slots.entry(entity.to_lowercase()).or_insert(0);
        *count += 1;
        *count
    }

    fn entity_generation(&self, entity: &str) -> u64 {
        self.task_slots
            .get(&entity.to_lowercase())
            .copied()
            .unwrap_or(0)
    }

    fn run_due_tasks(&mut self) {
        let now = current_time_millis();
        let mut due = Vec::new();
        let mut i = 0;
        while i < self.tasks.len() {
            if now >= self.tasks[i].next_time {
                due.push(self.tasks.remove(i));
            } else {
                i += 1;
            }
        }
        for task in due {
            self.run_task(task, now);
        }
    }

    fn run_task(&mut self, task: Task, now: u64) {
        let generation = task.generation;
        match task.kind {
            TaskKind::Probe { fullname, tick } => self.run_probe(fullname, tick, generation, now),
            TaskKind::Announce { fullname, tick } => {
                self.run_announce(fullname, tick, generation, now)
            }
            TaskKind::Renew {
                fullname,
                tick,
                cycle_start,
            } => self.run_renew(fullname, tick, cycle_start, generation, now),
            TaskKind::Respond => self.run_respond(now),
            TaskKind::Reap => self.run_reap(now),
            TaskKind::IpCheck => self.run_ip_check(now),
            TaskKind::TypeResolve { delay } => self.run_type_resolve(delay, now),
            TaskKind::ServiceResolve { ty_domain, delay } => {
                self.run_service_resolve(ty_domain, delay, now)
            }
            TaskKind::InfoResolve { fullname, delay } => {
                self.run_info_resolve(fullname, delay, now)
            }
            TaskKind::Goodbye {
                packets,
                tick,
                reply,
                done,
            } => self.run_goodbye(packets, tick, reply, done, now),
            TaskKind::ListReply { ty_domain, reply } => {
                let instances = self.build_instances(&ty_domain);
                if let Err(e) = reply.send(instances) {
                    debug!("failed to reply to list({}): {}", &ty_domain, e);
                }
            }
        }
    }

    // ---- probing / announcing / renewing / goodbye ----

    /// RFC 6762 section 8.1: before claiming its records a responder
    /// sends three probe queries, 250 ms apart, with the proposed records
    /// in the authority section.
    fn run_probe(&mut self, fullname: String, tick: u8, generation: u64, now: u64) {
        if generation != self.entity_generation(&fullname) {
            return;
        }
        let key = fullname.to_lowercase();
        let out = {
            let Some(entry) = self.my_services.get_mut(&key) else {
                return;
            };
            if entry.state.is_canceled() {
                return;
            }
            if tick == 0 && !entry.state.is_probing() {
                entry.state = ServiceState::Probing1;
            }

            let mut out = DnsOutgoing::new(FLAGS_QR_QUERY);
            out.add_question(entry.info.get_fullname(), RRType::ANY);
            if !entry
                .info
                .get_hostname()
                .eq_ignore_ascii_case(entry.info.get_fullname())
            {
                out.add_question(entry.info.get_hostname(), RRType::ANY);
            }
            for record in build_service_records(&entry.info) {
                out.add_authority(record);
            }
            out
        };

        let throttled = self.throttle.record_probe(now);
        self.send_on_all_intfs(&out);
        self.increase_counter(Counter::Probe, 1);

        if let Some(entry) = self.my_services.get_mut(&key) {
            entry.state = entry.state.advance();
        }

        if tick + 1 < PROBE_TICKS {
            let delay = if throttled {
                PROBE_THROTTLE_DELAY_MILLIS
            } else {
                PROBE_INTERVAL_MILLIS
            };
            self.schedule(
                now + delay,
                generation,
                TaskKind::Probe {
                    fullname,
                    tick: tick + 1,
                },
            );
        } else {
            self.schedule(
                now + ANNOUNCE_DELAY_MILLIS,
                generation,
                TaskKind::Announce { fullname, tick: 0 },
            );
        }
    }

    /// RFC 6762 section 8.3: a responder sends unsolicited responses
    /// publishing its newly claimed records.
    fn run_announce(&mut self, fullname: String, tick: u8, generation: u64, now: u64) {
        if generation != self.entity_generation(&fullname) {
            return;
        }
        let key = fullname.to_lowercase();
        let info = match self.my_services.get(&key) {
            Some(entry) if !entry.state.is_canceled() => entry.info.clone(),
            _ => return,
        };

        let outgoing_addrs = self.send_unsolicited_response(&info);
        self.increase_counter(Counter::Announce, 1);
        if !outgoing_addrs.is_empty() {
            self.notify_monitors(DaemonEvent::Announce(
                info.get_fullname().to_string(),
                format!("{:?}", &outgoing_addrs),
            ));
        }

        let (announced, waiters) = {
            let Some(entry) = self.my_services.get_mut(&key) else {
                return;
            };
            entry.state = entry.state.advance();
            let announced = entry.state.is_announced();
            let waiters: Vec<_> = if announced {
                entry.waiters.drain(..).collect()
            } else {
                Vec::new()
            };
            (announced, waiters)
        };
        for waiter in waiters {
            let _ = waiter.send(Ok(()));
        }

        if tick + 1 < ANNOUNCE_TICKS {
            self.schedule(
                now + ANNOUNCE_INTERVAL_MILLIS,
                generation,
                TaskKind::Announce {
                    fullname,
                    tick: tick + 1,
                },
            );
        } else if announced {
            let ttl_millis = u64::from(info.get_host_ttl()) * 1000;
            let next = now + ttl_millis * u64::from(RENEWAL_PERCENTS[0]) / 100
                + fastrand::u64(0..500);
            self.schedule(
                next,
                generation,
                TaskKind::Renew {
                    fullname,
                    tick: 0,
                    cycle_start: now,
                },
            );
        }
    }

    /// Keeps published records fresh: re-announces at 80%, 85%, 90% and
    /// 95% of the record TTL, then starts a new cycle.
    fn run_renew(&mut self, fullname: String, tick: u8, cycle_start: u64, generation: u64, now: u64) {
        if generation != self.entity_generation(&fullname) {
            return;
        }
        let key = fullname.to_lowercase();
        let info = match self.my_services.get(&key) {
            Some(entry) if entry.state.is_announced() => entry.info.clone(),
            _ => return,
        };

        self.send_unsolicited_response(&info);
        self.increase_counter(Counter::Renew, 1);

        let ttl_millis = u64::from(info.get_host_ttl()) * 1000;
        let next_tick = tick + 1;
        if (next_tick as usize) < RENEWAL_PERCENTS.len() {
            let next = cycle_start
                + ttl_millis * u64::from(RENEWAL_PERCENTS[next_tick as usize]) / 100
                + fastrand::u64(0..500);
            self.schedule(
                cmp::max(next, now + 1),
                generation,
                TaskKind::Renew {
                    fullname,
                    tick: next_tick,
                    cycle_start,
                },
            );
        } else {
            let next =
                now + ttl_millis * u64::from(RENEWAL_PERCENTS[0]) / 100 + fastrand::u64(0..500);
            self.schedule(
                next,
                generation,
                TaskKind::Renew {
                    fullname,
                    tick: 0,
                    cycle_start: now,
                },
            );
        }
    }

    /// Sends out announcement of `info` on every valid interface.
    /// Returns the list of interface IPs that sent out the announcement.
    fn send_unsolicited_response(&self, info: &ServiceInfo) -> Vec<IpAddr> {
        let mut outgoing_addrs = Vec::new();
        // Send the announcement on one interface per ip version.
        let mut multicast_sent_trackers = HashSet::new();

        for (intf, sock) in self.intf_socks.iter() {
            if let Some(tracker) = multicast_send_tracker(intf) {
                if multicast_sent_trackers.contains(&tracker) {
                    continue; // No need to send again on the same interface with same ip version.
                }
                multicast_sent_trackers.insert(tracker);
            }

            if let Some(out) = prepare_announce(info, intf) {
                send_dns_outgoing(&out, intf, sock);
                outgoing_addrs.push(intf.ip());
            }
        }

        outgoing_addrs
    }

    fn run_goodbye(
        &mut self,
        packets: Vec<(Interface, Vec<u8>)>,
        tick: u8,
        reply: Option<Sender<UnregisterStatus>>,
        done: Option<Sender<()>>,
        now: u64,
    ) {
        for (intf, packet) in packets.iter() {
            if let Some(sock) = self.intf_socks.get(intf) {
                multicast_on_intf(packet, intf, sock);
            }
        }
        self.increase_counter(Counter::GoodbyeResend, 1);

        if tick < GOODBYE_TICKS {
            self.schedule(
                now + GOODBYE_INTERVAL_MILLIS,
                0,
                TaskKind::Goodbye {
                    packets,
                    tick: tick + 1,
                    reply,
                    done,
                },
            );
        } else {
            if let Some(reply) = reply {
                let _ = reply.send(UnregisterStatus::OK);
            }
            if let Some(done) = done {
                let _ = done.send(());
            }
        }
    }

    /// Sends a last goodbye for every registered service, without
    /// retransmissions. Used when the daemon exits.
    fn send_goodbye_all(&mut self) {
        let mut multicast_sent_trackers = HashSet::new();
        for (intf, sock) in self.intf_socks.iter() {
            if let Some(tracker) = multicast_send_tracker(intf) {
                if multicast_sent_trackers.contains(&tracker) {
                    continue;
                }
                multicast_sent_trackers.insert(tracker);
            }
            let mut out = DnsOutgoing::new(FLAGS_QR_RESPONSE | FLAGS_AA);
            for entry in self.my_services.values() {
                add_goodbye_answers(&mut out, &entry.info, intf);
            }
            if out.answers_count() > 0 {
                send_dns_outgoing(&out, intf, sock);
            }
        }
    }

    // ---- cache maintenance ----

    /// Evicts expired records. Reaping is split from notification: the
    /// removed PTR/SRV records are turned into `ServiceRemoved` events
    /// here, for the types that have listeners.
    fn run_reap(&mut self, now: u64) {
        let removed = self.cache.reap(now);
        if !removed.is_empty() {
            self.increase_counter(Counter::CacheReap, removed.len() as i64);
        }

        for record in removed {
            match record.get_type() {
                RRType::PTR => {
                    if let Some(ptr) = record.any().downcast_ref::<DnsPointer>() {
                        self.resolved.remove(&ptr.alias);
                        call_service_listener(
                            &self.service_queriers,
                            record.get_name(),
                            ServiceEvent::ServiceRemoved(
                                record.get_name().to_string(),
                                ptr.alias.clone(),
                            ),
                        );
                    }
                }
                RRType::SRV => {
                    let name = record.get_name().to_string();
                    self.resolved.remove(&name);
                    let lower = name.to_lowercase();
                    for (ty_domain, sender) in self.service_queriers.iter() {
                        if lower.ends_with(&ty_domain.to_lowercase()) {
                            let _ = sender
                                .send(ServiceEvent::ServiceRemoved(ty_domain.clone(), name.clone()));
                        }
                    }
                }
                _ => {}
            }
        }

        self.schedule(now + REAPER_INTERVAL_MILLIS, 0, TaskKind::Reap);
    }

    // ---- responding to queries ----

    /// Answers the pending queries whose delay has elapsed.
    fn run_respond(&mut self, now: u64) {
        let mut due = Vec::new();
        let mut i = 0;
        while i < self.pending_responses.len() {
            if now >= self.pending_responses[i].due {
                due.push(self.pending_responses.remove(i));
            } else {
                i += 1;
            }
        }
        for pending in due {
            self.respond_to_query(pending);
        }
    }

    fn respond_to_query(&mut self, pending: PendingResponse) {
        let PendingResponse { msg, intf, .. } = pending;
        let mut out = DnsOutgoing::new(FLAGS_QR_RESPONSE | FLAGS_AA);

        // Additionals depend on which answers survive known-answer
        // suppression; they are collected aside and appended after all
        // answers so the section order stays questions, answers,
        // authorities, additionals.
        let mut extras: Vec<DnsRecordBox> = Vec::new();

        for question in msg.questions.iter() {
            trace!("query question: {:?}", &question);
            let qtype = question.entry.ty;

            if qtype == RRType::PTR {
                for entry in self.my_services.values() {
                    if !entry.state.is_announced() {
                        continue;
                    }
                    let service = &entry.info;

                    if question.entry.name.eq_ignore_ascii_case(service.get_type())
                        || service
                            .get_subtype()
                            .as_ref()
                            .is_some_and(|v| question.entry.name.eq_ignore_ascii_case(v))
                    {
                        add_answer_with_extras(&mut out, &msg, service, &intf, &mut extras);
                    } else if question.entry.name.eq_ignore_ascii_case(META_QUERY) {
                        let ptr_added = out.add_answer(
                            &msg,
                            Box::new(DnsPointer::new(
                                &question.entry.name,
                                RRType::PTR,
                                CLASS_IN,
                                service.get_other_ttl(),
                                service.get_type().to_string(),
                            )),
                        );
                        if !ptr_added {
                            trace!("answer was not added for meta-query {:?}", &question);
                        }
                    }
                }
            } else {
                if qtype == RRType::A || qtype == RRType::AAAA || qtype == RRType::ANY {
                    for entry in self.my_services.values() {
                        if !entry.state.is_announced() {
                            continue;
                        }
                        let service = &entry.info;
                        if service
                            .get_hostname()
                            .eq_ignore_ascii_case(&question.entry.name)
                        {
                            let intf_addrs = service.get_addrs_on_intf(&intf);
                            if intf_addrs.is_empty() && (qtype == RRType::A || qtype == RRType::AAAA)
                            {
                                trace!(
                                    "no valid addrs for {} response on intf {:?}",
                                    qtype,
                                    &intf
                                );
                                continue;
                            }
                            for address in intf_addrs {
                                out.add_answer(
                                    &msg,
                                    Box::new(DnsAddress::new(
                                        &question.entry.name,
                                        ip_address_rr_type(&address),
                                        CLASS_IN | CLASS_CACHE_FLUSH,
                                        service.get_host_ttl(),
                                        address,
                                    )),
                                );
                            }
                        }
                    }
                }

                let query_name = question.entry.name.to_lowercase();
                let Some(entry) = self.my_services.get(&query_name) else {
                    continue;
                };
                if !entry.state.is_announced() {
                    continue;
                }
                let service = &entry.info;

                if qtype == RRType::SRV || qtype == RRType::ANY {
                    out.add_answer(
                        &msg,
                        Box::new(DnsSrv::new(
                            &question.entry.name,
                            CLASS_IN | CLASS_CACHE_FLUSH,
                            service.get_host_ttl(),
                            service.get_priority(),
                            service.get_weight(),
                            service.get_port(),
                            service.get_hostname().to_string(),
                        )),
                    );
                }

                if qtype == RRType::TXT || qtype == RRType::ANY {
                    out.add_answer(
                        &msg,
                        Box::new(DnsTxt::new(
                            &question.entry.name,
                            CLASS_IN | CLASS_CACHE_FLUSH,
                            service.get_host_ttl(),
                            service.generate_txt(),
                        )),
                    );
                }

                if qtype == RRType::SRV {
                    for address in service.get_addrs_on_intf(&intf) {
                        extras.push(Box::new(DnsAddress::new(
                            service.get_hostname(),
                            ip_address_rr_type(&address),
                            CLASS_IN | CLASS_CACHE_FLUSH,
                            service.get_host_ttl(),
                            address,
                        )));
                    }
                }
            }
        }

        self.increase_counter(Counter::KnownAnswerSuppression, out.known_answer_count());

        if out.answers_count() > 0 {
            for extra in extras {
                out.add_additional_answer(extra);
            }
            out.set_id(msg.id);
            if let Some(sock) = self.intf_socks.get(&intf) {
                send_dns_outgoing(&out, &intf, sock);
            }
            self.increase_counter(Counter::Respond, 1);
            self.notify_monitors(DaemonEvent::Respond(intf.ip()));
        }
    }

    // ---- resolvers ----

    fn run_type_resolve(&mut self, delay: u64, now: u64) {
        self.type_listeners.retain(|s| !s.is_disconnected());
        if self.type_listeners.is_empty() {
            return;
        }
        self.send_query(META_QUERY, RRType::PTR);
        self.increase_counter(Counter::TypeBrowse, 1);

        let next_delay = cmp::min(delay * 2, RESOLVER_MAX_DELAY_MILLIS);
        self.schedule(now + delay, 0, TaskKind::TypeResolve { delay: next_delay });
    }

    fn run_service_resolve(&mut self, ty_domain: String, delay: u64, now: u64) {
        if !self.service_queriers.contains_key(&ty_domain)
            && !self.listed_types.contains(&ty_domain)
        {
            return;
        }
        self.send_query(&ty_domain, RRType::PTR);
        self.increase_counter(Counter::Browse, 1);

        let next_delay = cmp::min(delay * 2, RESOLVER_MAX_DELAY_MILLIS);
        self.schedule(
            now + delay,
            0,
            TaskKind::ServiceResolve {
                ty_domain,
                delay: next_delay,
            },
        );
    }

    fn run_info_resolve(&mut self, fullname: String, delay: u64, now: u64) {
        let key = fullname.to_lowercase();
        let Some((ty_domain, full)) = self
            .info_resolvers
            .get(&key)
            .map(|r| (r.ty_domain.clone(), r.fullname.clone()))
        else {
            return;
        };

        // Resolved already?
        if let Ok(info) = self.create_service_info_from_cache(&ty_domain, &full) {
            if info.is_ready() {
                if let Some(resolver) = self.info_resolvers.remove(&key) {
                    for (sender, _) in resolver.waiters {
                        let _ = sender.send(Some(info.clone()));
                    }
                }
                return;
            }
        }

        // Time out the waiters whose deadline has passed.
        let mut earliest_deadline = u64::MAX;
        let mut waiterless = true;
        if let Some(resolver) = self.info_resolvers.get_mut(&key) {
            resolver.waiters.retain(|(sender, deadline)| {
                if now >= *deadline {
                    let _ = sender.send(None);
                    false
                } else {
                    true
                }
            });
            for (_, deadline) in resolver.waiters.iter() {
                earliest_deadline = cmp::min(earliest_deadline, *deadline);
            }
            waiterless = resolver.waiters.is_empty();
        }

        if waiterless && delay >= RESOLVER_IDLE_MAX_DELAY_MILLIS {
            self.info_resolvers.remove(&key);
            return;
        }

        // Ask for what is still missing: SRV and TXT of the instance,
        // then the addresses of its SRV target.
        let mut questions: Vec<(String, RRType)> = vec![
            (full.clone(), RRType::SRV),
            (full.clone(), RRType::TXT),
        ];
        let host = self
            .cache
            .records_by_type(&full, RRType::SRV)
            .find_map(|r| r.any().downcast_ref::<DnsSrv>().map(|s| s.host.clone()));
        if let Some(host) = host {
            questions.push((host.clone(), RRType::A));
            questions.push((host, RRType::AAAA));
        }
        let question_refs: Vec<(&str, RRType)> =
            questions.iter().map(|(n, t)| (n.as_str(), *t)).collect();
        self.send_query_vec(&question_refs);
        self.increase_counter(Counter::ResolveQuery, 1);

        let next_delay = cmp::min(delay * 2, RESOLVER_MAX_DELAY_MILLIS);
        let mut next_time = now + next_delay;
        if earliest_deadline != u64::MAX {
            next_time = cmp::min(next_time, earliest_deadline);
        }
        self.schedule(
            cmp::max(next_time, now + 1),
            0,
            TaskKind::InfoResolve {
                fullname: full,
                delay: next_delay,
            },
        );
    }

    /// Starts a browse-driven resolution of `instance` unless one is
    /// already in flight.
    fn add_pending_resolve(&mut self, instance: String) {
        if !valid_instance_name(&instance) {
            trace!("instance name {} not valid", &instance);
            return;
        }
        let key = instance.to_lowercase();
        if self.info_resolvers.contains_key(&key) {
            return;
        }
        let Some(ty_domain) = self.derive_ty_domain(&instance) else {
            trace!("no active query matches instance {}", &instance);
            return;
        };
        self.info_resolvers.insert(
            key,
            InfoResolver {
                ty_domain,
                fullname: instance.clone(),
                waiters: Vec::new(),
            },
        );
        let now = current_time_millis();
        self.schedule(
            now + RESOLVER_INITIAL_DELAY_MILLIS,
            0,
            TaskKind::InfoResolve {
                fullname: instance,
                delay: RESOLVER_INITIAL_DELAY_MILLIS,
            },
        );
    }

    /// Finds the browsed or listed type that `fullname` belongs to.
    fn derive_ty_domain(&self, fullname: &str) -> Option<String> {
        let lower = fullname.to_lowercase();
        self.service_queriers
            .keys()
            .chain(self.listed_types.iter())
            .find(|ty| lower.ends_with(&ty.to_lowercase()) && lower.len() > ty.len())
            .cloned()
    }

    /// Releases `get_service_info` callers of `fullname` if it is now
    /// fully resolved.
    fn complete_info_waiters(&mut self, fullname: &str) {
        let key = fullname.to_lowercase();
        let Some((ty_domain, full)) = self
            .info_resolvers
            .get(&key)
            .map(|r| (r.ty_domain.clone(), r.fullname.clone()))
        else {
            return;
        };
        let info = match self.create_service_info_from_cache(&ty_domain, &full) {
            Ok(info) if info.is_ready() => info,
            _ => return,
        };
        if let Some(resolver) = self.info_resolvers.remove(&key) {
            for (sender, _) in resolver.waiters {
                let _ = sender.send(Some(info.clone()));
            }
        }
    }

    // ---- the dispatcher: incoming frames ----

    /// Reads from the socket of `intf`.
    ///
    /// Returns false if failed to receive a packet,
    /// otherwise returns true.
    fn handle_read(&mut self, intf: &Interface) -> bool {
        let mut buf = vec![0u8; MAX_MSG_ABSOLUTE];

        // Read the next mDNS UDP datagram.
        //
        // If the datagram is larger than `buf`, excess bytes may or may not
        // be truncated by the socket layer depending on the platform's libc.
        // In any case, such large datagram will not be decoded properly and
        // this function should return false but should not crash.
        let (sz, peer) = {
            let Some(sock) = self.intf_socks.get_mut(intf) else {
                return false;
            };
            match sock.recv_from(&mut buf) {
                Ok(sz_peer) => sz_peer,
                Err(e) => {
                    if e.kind() != std::io::ErrorKind::WouldBlock {
                        debug!("listening socket read failed: {}", e);
                    }
                    return false;
                }
            }
        };

        trace!("received {} bytes from {} at IP: {}", sz, peer, intf.ip());

        // If sz is 0, it means sock reached End-of-File.
        if sz == 0 {
            debug!("socket on {} was likely shutdown", intf.ip());
            self.rebuild_socket(intf);
            return false;
        }

        buf.truncate(sz); // reduce potential processing errors

        match DnsIncoming::new(buf) {
            Ok(msg) => {
                if msg.is_query() {
                    self.handle_query(msg, intf, peer);
                } else if msg.is_response() {
                    self.handle_response(msg, intf);
                } else {
                    debug!("Invalid message: not query and not response");
                }
            }
            Err(e) => debug!("Invalid incoming DNS message from {}: {}", peer, e),
        }

        true
    }

    /// Replaces a dead socket with a freshly bound and registered one.
    ///
    /// This covers the recovery path of the host address changing under
    /// the daemon: the socket is rebuilt and rejoins the group, and the
    /// registered services keep answering from the same records.
    fn rebuild_socket(&mut self, intf: &Interface) {
        if let Some(mut sock) = self.intf_socks.remove(intf) {
            if let Err(e) = self.poller.registry().deregister(&mut sock) {
                debug!("failed to remove dead socket from poller: {}", e);
            }
        }
        self.poll_ids.retain(|_, v| v != intf);

        let should_loop = if intf.ip().is_ipv4() {
            self.multicast_loop_v4
        } else {
            self.multicast_loop_v6
        };
        match new_socket_bind(intf, should_loop) {
            Ok(mut new_sock) => {
                let key = self.add_poll(intf.clone());
                if let Err(e) = self.poller.registry().register(
                    &mut new_sock,
                    mio::Token(key),
                    mio::Interest::READABLE,
                ) {
                    debug!("failed to register rebuilt socket: {}", e);
                    return;
                }
                trace!("reset socket for IP {}", intf.ip());
                self.intf_socks.insert(intf.clone(), new_sock);
            }
            Err(e) => debug!("re-bind a socket to {:?}: {}", intf, e),
        }
    }

    /// Handle incoming query packets, figure out whether and what to respond.
    fn handle_query(&mut self, msg: DnsIncoming, intf: &Interface, peer: SocketAddr) {
        let now = current_time_millis();

        // Known answers in the query can dispute records we own.
        let conflicts = self.collect_conflicts(&msg, intf);
        for (key, host_conflict) in conflicts {
            self.handle_conflict(key, host_conflict, now);
        }

        // Truncation chain (RFC 6762 section 7.2): continuations from the
        // same peer extend the pending query instead of each spawning a
        // responder; one responder drains the fully assembled query.
        if let Some(pending) = self
            .pending_responses
            .iter_mut()
            .find(|p| p.peer == peer && p.msg.is_truncated() && p.msg.is_query())
        {
            trace!("merging continuation query from {}", peer);
            pending.msg.append(msg);
            return;
        }

        // The random delay reduces collisions between responders on
        // the same network answering the same question.
        let due = now + fastrand::u64(RESPONDER_DELAY_MIN_MILLIS..=RESPONDER_DELAY_MAX_MILLIS);
        self.pending_responses.push(PendingResponse {
            msg,
            intf: intf.clone(),
            peer,
            due,
        });
        self.schedule(due, 0, TaskKind::Respond);
    }

    /// Deal with incoming response packets. All answers
    /// are held in the cache, and listeners are notified.
    fn handle_response(&mut self, msg: DnsIncoming, intf: &Interface) {
        trace!(
            "handle_response: {} answers {} authorities {} additionals",
            msg.answers.len(),
            msg.authorities.len(),
            msg.additionals.len()
        );
        let now = current_time_millis();

        // Check possible conflicts and handle them.
        let conflicts = self.collect_conflicts(&msg, intf);
        for (key, host_conflict) in conflicts {
            self.handle_conflict(key, host_conflict, now);
        }

        // Go through all records to update the cache. A record is
        // "informative" when it changes what we know: a goodbye for a
        // record we have, or a record we did not have. Only informative
        // records are delivered to listeners; a plain TTL refresh is not.
        let mut changes: Vec<(RRType, String)> = Vec::new();

        for record in msg.all_records() {
            if record.get_record().is_expired(now) {
                if self.cache.get(record.as_ref()).is_some() {
                    self.cache.remove(record.as_ref());
                    // A goodbye: the record was present, listeners hear
                    // about the removal.
                    if let Some(ptr) = record.any().downcast_ref::<DnsPointer>() {
                        self.resolved.remove(&ptr.alias);
                        call_service_listener(
                            &self.service_queriers,
                            record.get_name(),
                            ServiceEvent::ServiceRemoved(
                                record.get_name().to_string(),
                                ptr.alias.clone(),
                            ),
                        );
                    }
                }
                continue;
            }

            let (ty, name, alias, is_new) = {
                let (cached, is_new) = self.cache.add_or_refresh(record.clone());
                let alias = cached
                    .any()
                    .downcast_ref::<DnsPointer>()
                    .map(|p| p.alias.clone());
                (cached.get_type(), cached.get_name().to_string(), alias, is_new)
            };

            if !is_new {
                continue;
            }

            if ty == RRType::PTR {
                if let Some(alias) = alias {
                    if name.eq_ignore_ascii_case(META_QUERY) {
                        // A type enumeration answer names a service type.
                        self.register_service_type(alias);
                    } else {
                        self.register_service_type(name.clone());
                        call_service_listener(
                            &self.service_queriers,
                            &name,
                            ServiceEvent::ServiceFound(name.clone(), alias.clone()),
                        );
                        changes.push((RRType::PTR, alias));
                    }
                }
            } else {
                changes.push((ty, name));
            }
        }

        // Identify the instances that need to be "resolved".
        let mut updated_instances = HashSet::new();
        for (ty, name) in changes {
            match ty {
                RRType::PTR | RRType::SRV | RRType::TXT => {
                    updated_instances.insert(name);
                }
                RRType::A | RRType::AAAA => {
                    updated_instances.extend(self.cache.instances_on_host(&name));
                }
                _ => {}
            }
        }

        self.resolve_updated_instances(&updated_instances);
    }

    /// Finds incoming records that dispute ownership of our unique
    /// records: same name, unique bit set, different rdata.
    ///
    /// Returns the keys of the disputed services, with a flag telling a
    /// host (address) conflict from a service (SRV/TXT) conflict.
    fn collect_conflicts(&self, msg: &DnsIncoming, intf: &Interface) -> Vec<(String, bool)> {
        let mut found: HashSet<(String, bool)> = HashSet::new();

        for record in msg.all_records() {
            for (key, entry) in self.my_services.iter() {
                let info = &entry.info;
                match record.get_type() {
                    RRType::SRV | RRType::TXT => {
                        if !record.get_name().eq_ignore_ascii_case(info.get_fullname()) {
                            continue;
                        }
                        let ours: DnsRecordBox = if record.get_type() == RRType::SRV {
                            Box::new(DnsSrv::new(
                                info.get_fullname(),
                                CLASS_IN | CLASS_CACHE_FLUSH,
                                info.get_host_ttl(),
                                info.get_priority(),
                                info.get_weight(),
                                info.get_port(),
                                info.get_hostname().to_string(),
                            ))
                        } else {
                            Box::new(DnsTxt::new(
                                info.get_fullname(),
                                CLASS_IN | CLASS_CACHE_FLUSH,
                                info.get_other_ttl(),
                                info.generate_txt(),
                            ))
                        };
                        if ours.conflicts_with(record.as_ref()) {
                            debug!(
                                "conflict: {} '{}' PEER: {}",
                                record.get_type(),
                                record.get_name(),
                                record.rdata_print()
                            );
                            found.insert((key.clone(), false));
                        }
                    }
                    RRType::A | RRType::AAAA => {
                        if record.is_unique()
                            && record.get_name().eq_ignore_ascii_case(info.get_hostname())
                        {
                            if let Some(addr) = record.any().downcast_ref::<DnsAddress>() {
                                // Guard against multicast forwarding from
                                // another subnet.
                                if !valid_ip_on_intf(&addr.address, intf) {
                                    continue;
                                }
                                if !info.get_addresses().is_empty()
                                    && !info.get_addresses().contains(&addr.address)
                                {
                                    debug!(
                                        "conflict: addr '{}' PEER: {}",
                                        record.get_name(),
                                        record.rdata_print()
                                    );
                                    found.insert((key.clone(), true));
                                }
                            }
                        }
                    }
                    _ => {}
                }
            }
        }

        found.into_iter().collect()
    }

    /// Resolves a name conflict on the service keyed by `key`.
    ///
    /// While still probing, the disputed name is changed to the next
    /// candidate (`"foo"` to `"foo (2)"`, hostnames `"foo"` to `"foo-2"`)
    /// and probing restarts from the beginning. After announcement, the
    /// state is reverted one step and a new prober takes over.
    fn handle_conflict(&mut self, key: String, host_conflict: bool, now: u64) {
        let Some(mut entry) = self.my_services.remove(&key) else {
            return;
        };
        // Cancel whatever task currently drives the old name.
        self.install_entity_task(&key);

        if entry.state.is_probing() {
            if host_conflict {
                let original = entry.info.get_hostname().to_string();
                let new_name = hostname_change(&original);
                debug!("conflict: hostname {} becomes {}", &original, &new_name);
                self.notify_monitors(DaemonEvent::NameChange(DnsNameChange {
                    original,
                    new_name: new_name.clone(),
                    rr_type: RRType::A,
                }));
                entry.info.set_hostname(new_name);
            } else {
                let original = entry.info.get_fullname().to_string();
                let new_name = name_change(&original, entry.info.get_type());
                debug!("conflict: instance {} becomes {}", &original, &new_name);
                self.notify_monitors(DaemonEvent::NameChange(DnsNameChange {
                    original,
                    new_name: new_name.clone(),
                    rr_type: RRType::SRV,
                }));
                entry.info.set_fullname(new_name);
            }
            entry.state = ServiceState::Probing1;
        } else {
            entry.state = entry.state.revert();
        }

        let fullname = entry.info.get_fullname().to_string();
        let new_key = fullname.to_lowercase();
        let generation = self.install_entity_task(&new_key);
        self.my_services.insert(new_key, entry);
        self.schedule(
            now + fastrand::u64(0..250),
            generation,
            TaskKind::Probe { fullname, tick: 0 },
        );
    }

    /// Resolve the updated (including new) instances.
    ///
    /// Note: it is possible that more than 1 PTR pointing to the same
    /// instance. For example, a regular service type PTR and a sub-type
    /// service type PTR can both point to the same service instance.
    /// This loop automatically handles the sub-type PTRs.
    fn resolve_updated_instances(&mut self, updated_instances: &HashSet<String>) {
        if updated_instances.is_empty() {
            return;
        }

        let mut resolved: HashSet<String> = HashSet::new();
        let mut unresolved: HashSet<String> = HashSet::new();
        let mut removed_instances: HashMap<String, HashSet<String>> = HashMap::new();

        for (ty_domain, sender) in self.service_queriers.iter() {
            for record in self.cache.records_by_type(ty_domain, RRType::PTR) {
                let Some(ptr) = record.any().downcast_ref::<DnsPointer>() else {
                    continue;
                };
                if !updated_instances.contains(&ptr.alias) {
                    continue;
                }
                match self.create_service_info_from_cache(ty_domain, &ptr.alias) {
                    Ok(info) if info.is_ready() => {
                        resolved.insert(ptr.alias.clone());
                        let _ = sender.send(ServiceEvent::ServiceResolved(info));
                    }
                    Ok(_) => {
                        if self.resolved.contains(&ptr.alias) {
                            removed_instances
                                .entry(ty_domain.clone())
                                .or_default()
                                .insert(ptr.alias.clone());
                        }
                        unresolved.insert(ptr.alias.clone());
                    }
                    Err(e) => {
                        debug!("error while creating service info from cache: {}", e);
                    }
                }
            }
        }

        for instance in resolved {
            self.resolved.insert(instance.clone());
            self.complete_info_waiters(&instance);
        }
        for instance in unresolved {
            self.add_pending_resolve(instance);
        }
        for (ty_domain, instances) in removed_instances {
            for instance in instances {
                self.resolved.remove(&instance);
                call_service_listener(
                    &self.service_queriers,
                    &ty_domain,
                    ServiceEvent::ServiceRemoved(ty_domain.clone(), instance),
                );
            }
        }
    }

    /// Builds a service info of `fullname` from the cached records.
    fn create_service_info_from_cache(
        &self,
        ty_domain: &str,
        fullname: &str,
    ) -> Result<ServiceInfo> {
        let my_name = {
            let name = fullname.trim_end_matches(crate::service_info::split_sub_domain(ty_domain).0);
            name.strip_suffix('.').unwrap_or(name).to_string()
        };

        let now = current_time_millis();
        let mut info = ServiceInfo::new(ty_domain, &my_name, "", (), 0, None)?;

        // Be sure setting `subtype` if available even when querying for
        // the parent domain.
        if let Some(subtype) = self.cache.get_subtype(fullname) {
            trace!(
                "ty_domain: {} found subtype {} for instance: {}",
                ty_domain,
                subtype,
                fullname
            );
            if info.get_subtype().is_none() {
                info.set_subtype(subtype.clone());
            }
        }

        // resolve SRV record
        if let Some(record) = self.cache.records_by_type(fullname, RRType::SRV).next() {
            if let Some(dns_srv) = record.any().downcast_ref::<DnsSrv>() {
                info.set_hostname(dns_srv.host.clone());
                info.set_port(dns_srv.port);
            }
        }

        // resolve TXT record
        if let Some(record) = self.cache.records_by_type(fullname, RRType::TXT).next() {
            if let Some(dns_txt) = record.any().downcast_ref::<DnsTxt>() {
                info.set_properties_from_txt(&dns_txt.text);
            }
        }

        // resolve A and AAAA records
        for record in self.cache.get_by_name(info.get_hostname()).into_iter().flatten() {
            if let Some(dns_a) = record.any().downcast_ref::<DnsAddress>() {
                if dns_a.record.is_expired(now) {
                    trace!("Addr expired: {}", &dns_a.address);
                } else {
                    info.insert_ipaddr(dns_a.address);
                }
            }
        }

        Ok(info)
    }

    /// Checks if `ty_domain` has records in the cache. If yes, sends the
    /// cached records via `sender`.
    fn query_cache_for_service(&mut self, ty_domain: &str, sender: &Sender<ServiceEvent>) {
        let mut resolved: HashSet<String> = HashSet::new();
        let mut unresolved: HashSet<String> = HashSet::new();

        let aliases: Vec<String> = self
            .cache
            .records_by_type(ty_domain, RRType::PTR)
            .filter_map(|r| r.any().downcast_ref::<DnsPointer>().map(|p| p.alias.clone()))
            .collect();

        for alias in aliases {
            let info = match self.create_service_info_from_cache(ty_domain, &alias) {
                Ok(info) => info,
                Err(e) => {
                    debug!("error while creating service info from cache: {}", e);
                    continue;
                }
            };

            match sender.send(ServiceEvent::ServiceFound(
                ty_domain.to_string(),
                alias.clone(),
            )) {
                Ok(()) => trace!("send service found {}", &alias),
                Err(e) => {
                    debug!("failed to send service found: {}", e);
                    continue;
                }
            }

            if info.is_ready() {
                resolved.insert(alias.clone());
                match sender.send(ServiceEvent::ServiceResolved(info)) {
                    Ok(()) => trace!("sent service resolved: {}", &alias),
                    Err(e) => debug!("failed to send service resolved: {}", e),
                }
            } else {
                unresolved.insert(alias);
            }
        }

        for instance in resolved {
            self.resolved.insert(instance);
        }
        for instance in unresolved {
            self.add_pending_resolve(instance);
        }
    }

    /// Returns the fully resolved instances of `ty_domain` from the cache.
    fn build_instances(&self, ty_domain: &str) -> Vec<ServiceInfo> {
        self.cache
            .records_by_type(ty_domain, RRType::PTR)
            .filter_map(|record| {
                let ptr = record.any().downcast_ref::<DnsPointer>()?;
                self.create_service_info_from_cache(ty_domain, &ptr.alias).ok()
            })
            .filter(|info| info.is_ready())
            .collect()
    }

    /// Records a newly seen service type and tells the type listeners.
    fn register_service_type(&mut self, ty_domain: String) {
        let key = ty_domain.to_lowercase();
        if self.service_types.contains_key(&key) {
            return;
        }
        if ty_domain.eq_ignore_ascii_case(META_QUERY)
            || ty_domain.ends_with(REVERSE_DOMAIN_SUFFIX)
        {
            return;
        }
        self.service_types.insert(key, ty_domain.clone());
        self.type_listeners
            .retain(|sender| sender.send(ServiceTypeEvent::TypeAdded(ty_domain.clone())).is_ok());
    }

    // ---- outgoing queries ----

    /// Sends a multicast query for `name` with `qtype`.
    fn send_query(&self, name: &str, qtype: RRType) {
        self.send_query_vec(&[(name, qtype)]);
    }

    /// Sends out a list of `questions` (i.e. DNS questions) via multicast.
    fn send_query_vec(&self, questions: &[(&str, RRType)]) {
        trace!("Sending query questions: {:?}", questions);
        let mut out = DnsOutgoing::new(FLAGS_QR_QUERY);
        let now = current_time_millis();

        for (name, qtype) in questions {
            out.add_question(name, *qtype);
        }

        // RFC 6762 section 7.1: a querier fills the answer section of its
        // query with the answers it already knows.
        for (name, qtype) in questions {
            for record in self.cache.known_answers(name, *qtype, now) {
                trace!("add known answer: {:?}", record);
                out.add_answer_at_time(record.clone(), now);
            }
        }

        self.send_on_all_intfs(&out);
    }

    /// Sends `out` on one interface per IP version.
    fn send_on_all_intfs(&self, out: &DnsOutgoing) {
        let mut multicast_sent_trackers = HashSet::new();
        for (intf, sock) in self.intf_socks.iter() {
            if let Some(tracker) = multicast_send_tracker(intf) {
                if multicast_sent_trackers.contains(&tracker) {
                    continue;
                }
                multicast_sent_trackers.insert(tracker);
            }
            send_dns_outgoing(out, intf, sock);
        }
    }

    // ---- command execution ----

    /// The entry point that executes all commands received by the daemon.
    fn exec_command(&mut self, command: Command) {
        match command {
            Command::Browse(ty, listener) => {
                self.exec_command_browse(ty, listener);
            }

            Command::BrowseTypes(listener) => {
                self.exec_command_browse_types(listener);
            }

            Command::Register(service_info, reply) => {
                self.exec_command_register(service_info, reply);
            }

            Command::Unregister(fullname, resp_s) => {
                trace!("unregister service {}", &fullname);
                self.exec_command_unregister(fullname, resp_s);
            }

            Command::UnregisterAll(done) => {
                self.exec_command_unregister_all(done);
            }

            Command::StopBrowse(ty_domain) => self.exec_command_stop_browse(ty_domain),

            Command::GetServiceInfo(ty, name, timeout, reply) => {
                self.exec_command_get_service_info(ty, name, timeout, reply);
            }

            Command::List(ty, reply) => {
                self.exec_command_list(ty, reply);
            }

            Command::GetMetrics(resp_s) => match resp_s.send(self.counters.clone()) {
                Ok(()) => trace!("Sent metrics to the client"),
                Err(e) => debug!("Failed to send metrics: {}", e),
            },

            Command::GetStatus(resp_s) => match resp_s.send(self.status.clone()) {
                Ok(()) => trace!("Sent status to the client"),
                Err(e) => debug!("Failed to send status: {}", e),
            },

            Command::Monitor(resp_s) => {
                self.monitors.push(resp_s);
            }

            Command::SetOption(daemon_opt) => {
                self.process_set_option(daemon_opt);
            }

            _ => {
                debug!("unexpected command: {:?}", &command);
            }
        }
    }

    fn exec_command_browse(&mut self, ty: String, listener: Sender<ServiceEvent>) {
        let pretty_addrs: Vec<String> = self
            .intf_socks
            .keys()
            .map(|itf| format!("{} ({})", itf.ip(), itf.name))
            .collect();

        if let Err(e) = listener.send(ServiceEvent::SearchStarted(format!(
            "{ty} on {} interfaces [{}]",
            pretty_addrs.len(),
            pretty_addrs.join(", ")
        ))) {
            debug!("Failed to send SearchStarted({}): {}", &ty, e);
            return;
        }

        // Binds a `listener` to querying mDNS domain type `ty`.
        //
        // If there is already a `listener`, it will be updated, i.e. overwritten.
        self.service_queriers.insert(ty.clone(), listener.clone());
        self.register_service_type(ty.clone());

        // If we already have the records in our cache, just send them.
        self.query_cache_for_service(&ty, &listener);

        let now = current_time_millis();
        self.schedule(
            now + fastrand::u64(0..250),
            0,
            TaskKind::ServiceResolve {
                ty_domain: ty,
                delay: RESOLVER_INITIAL_DELAY_MILLIS,
            },
        );
    }

    fn exec_command_browse_types(&mut self, listener: Sender<ServiceTypeEvent>) {
        // Report known types once, then keep the listener for updates.
        for ty in self.service_types.values() {
            if listener.send(ServiceTypeEvent::TypeAdded(ty.clone())).is_err() {
                return;
            }
        }
        self.type_listeners.push(listener);

        let now = current_time_millis();
        self.schedule(
            now,
            0,
            TaskKind::TypeResolve {
                delay: RESOLVER_INITIAL_DELAY_MILLIS,
            },
        );
    }

    /// Registers a service.
    ///
    /// RFC 6762 section 8.3.
    /// ...the Multicast DNS responder MUST send
    ///    an unsolicited Multicast DNS response containing, in the Answer
    ///    Section, all of its newly registered resource records
    ///
    /// We will then respond to requests for information about this service.
    fn exec_command_register(&mut self, mut info: ServiceInfo, reply: Sender<Result<()>>) {
        if let Err(e) = check_service_name_length(info.get_type(), self.service_name_len_max) {
            debug!("check_service_name_length: {}", &e);
            self.notify_monitors(DaemonEvent::Error(e.clone()));
            let _ = reply.send(Err(e));
            return;
        }

        if info.is_addr_auto() {
            for addr in self.selected_addrs(my_ip_interfaces()) {
                info.insert_ipaddr(addr);
            }
        }

        debug!("register service {:?}", &info);
        self.register_service_type(info.get_type().to_string());

        let fullname = info.get_fullname().to_string();
        let key = fullname.to_lowercase();
        let generation = self.install_entity_task(&key);
        let now = current_time_millis();

        let announced = match self.my_services.entry(key) {
            Entry::Occupied(mut occupied) => {
                // Re-registering updates the info and re-announces;
                // no new probing needed for a name we already hold.
                let entry = occupied.get_mut();
                entry.info = info;
                entry.waiters.push(reply);
                let announced = entry.state.is_announced();
                if !announced {
                    entry.state = ServiceState::Probing1;
                }
                announced
            }
            Entry::Vacant(vacant) => {
                vacant.insert(ServiceEntry {
                    info,
                    state: ServiceState::Probing1,
                    waiters: vec![reply],
                });
                false
            }
        };

        if announced {
            self.schedule(now, generation, TaskKind::Announce { fullname, tick: 0 });
        } else {
            self.schedule(
                now + fastrand::u64(0..250),
                generation,
                TaskKind::Probe { fullname, tick: 0 },
            );
        }

        self.increase_counter(Counter::Register, 1);
    }

    fn exec_command_unregister(&mut self, fullname: String, resp_s: Sender<UnregisterStatus>) {
        let now = current_time_millis();
        match self.my_services.remove(&fullname) {
            None => {
                debug!("unregister: cannot find such service {}", &fullname);
                if let Err(e) = resp_s.send(UnregisterStatus::NotFound) {
                    debug!("unregister: failed to send response: {}", e);
                }
            }
            Some(entry) => {
                self.install_entity_task(&fullname);
                let packets = self.send_goodbye(&entry.info);
                self.increase_counter(Counter::Unregister, 1);

                if packets.is_empty() {
                    if let Err(e) = resp_s.send(UnregisterStatus::OK) {
                        debug!("unregister: failed to send response: {}", e);
                    }
                } else {
                    self.schedule(
                        now + GOODBYE_INTERVAL_MILLIS,
                        0,
                        TaskKind::Goodbye {
                            packets,
                            tick: 1,
                            reply: Some(resp_s),
                            done: None,
                        },
                    );
                }
            }
        }
    }

    fn exec_command_unregister_all(&mut self, done: Sender<()>) {
        let keys: Vec<String> = self.my_services.keys().cloned().collect();
        if keys.is_empty() {
            let _ = done.send(());
            return;
        }

        let infos: Vec<ServiceInfo> = self
            .my_services
            .drain()
            .map(|(_, entry)| entry.info)
            .collect();
        for key in keys {
            self.install_entity_task(&key);
        }

        let now = current_time_millis();
        let mut packets = Vec::new();
        let mut multicast_sent_trackers = HashSet::new();
        for (intf, sock) in self.intf_socks.iter() {
            if let Some(tracker) = multicast_send_tracker(intf) {
                if multicast_sent_trackers.contains(&tracker) {
                    continue;
                }
                multicast_sent_trackers.insert(tracker);
            }
            let mut out = DnsOutgoing::new(FLAGS_QR_RESPONSE | FLAGS_AA);
            for info in infos.iter() {
                add_goodbye_answers(&mut out, info, intf);
            }
            if out.answers_count() == 0 {
                continue;
            }
            let mut packet_list = send_dns_outgoing(&out, intf, sock);
            if !packet_list.is_empty() {
                packets.push((intf.clone(), packet_list.remove(0)));
            }
        }

        self.increase_counter(Counter::Unregister, infos.len() as i64);

        if packets.is_empty() {
            let _ = done.send(());
        } else {
            self.schedule(
                now + GOODBYE_INTERVAL_MILLIS,
                0,
                TaskKind::Goodbye {
                    packets,
                    tick: 1,
                    reply: None,
                    done: Some(done),
                },
            );
        }
    }

    /// Sends the goodbye (all records with TTL 0) of `info` on every
    /// interface, and returns the packets for retransmission.
    fn send_goodbye(&self, info: &ServiceInfo) -> Vec<(Interface, Vec<u8>)> {
        let mut packets = Vec::new();
        let mut multicast_sent_trackers = HashSet::new();

        for (intf, sock) in self.intf_socks.iter() {
            if let Some(tracker) = multicast_send_tracker(intf) {
                if multicast_sent_trackers.contains(&tracker) {
                    continue;
                }
                multicast_sent_trackers.insert(tracker);
            }

            let mut out = DnsOutgoing::new(FLAGS_QR_RESPONSE | FLAGS_AA);
            add_goodbye_answers(&mut out, info, intf);
            if out.answers_count() == 0 {
                continue;
            }
            let mut packet_list = send_dns_outgoing(&out, intf, sock);
            if !packet_list.is_empty() {
                packets.push((intf.clone(), packet_list.remove(0)));
            }
        }

        packets
    }

    fn exec_command_stop_browse(&mut self, ty_domain: String) {
        match self.service_queriers.remove_entry(&ty_domain) {
            None => debug!("StopBrowse: cannot find querier for {}", &ty_domain),
            Some((ty, sender)) => {
                // The periodic ServiceResolve task dies by itself once
                // the querier is gone.
                match sender.send(ServiceEvent::SearchStopped(ty)) {
                    Ok(()) => trace!("Sent SearchStopped to the listener"),
                    Err(e) => debug!("Failed to send SearchStopped: {}", e),
                }
            }
        }
    }

    fn exec_command_get_service_info(
        &mut self,
        ty: String,
        name: String,
        timeout: u64,
        reply: Sender<Option<ServiceInfo>>,
    ) {
        let fullname = format!("{}.{}", name, ty);
        self.register_service_type(ty.clone());

        if let Ok(info) = self.create_service_info_from_cache(&ty, &fullname) {
            if info.is_ready() {
                let _ = reply.send(Some(info));
                return;
            }
        }

        let now = current_time_millis();
        let deadline = now + timeout;
        let key = fullname.to_lowercase();
        self.info_resolvers
            .entry(key)
            .or_insert_with(|| InfoResolver {
                ty_domain: ty,
                fullname: fullname.clone(),
                waiters: Vec::new(),
            })
            .waiters
            .push((reply, deadline));

        let next_time = cmp::min(now + RESOLVER_INITIAL_DELAY_MILLIS, deadline);
        self.schedule(
            next_time,
            0,
            TaskKind::InfoResolve {
                fullname,
                delay: RESOLVER_INITIAL_DELAY_MILLIS,
            },
        );
    }

    fn exec_command_list(&mut self, ty: String, reply: Sender<Vec<ServiceInfo>>) {
        if self.listed_types.contains(&ty) || self.service_queriers.contains_key(&ty) {
            let instances = self.build_instances(&ty);
            let _ = reply.send(instances);
            return;
        }

        // First call for this type: query for it and give answers a
        // grace window to arrive before replying.
        self.listed_types.insert(ty.clone());
        self.register_service_type(ty.clone());
        self.send_query(&ty, RRType::PTR);
        self.increase_counter(Counter::Browse, 1);

        let now = current_time_millis();
        self.schedule(
            now + LIST_GRACE_MILLIS,
            0,
            TaskKind::ListReply {
                ty_domain: ty.clone(),
                reply,
            },
        );
        self.schedule(
            now + RESOLVER_INITIAL_DELAY_MILLIS,
            0,
            TaskKind::ServiceResolve {
                ty_domain: ty,
                delay: RESOLVER_INITIAL_DELAY_MILLIS,
            },
        );
    }

    // ---- interface management ----

    fn process_set_option(&mut self, daemon_opt: DaemonOption) {
        match daemon_opt {
            DaemonOption::ServiceNameLenMax(length) => self.service_name_len_max = length,
            DaemonOption::EnableInterface(if_kind) => self.enable_interface(if_kind),
            DaemonOption::DisableInterface(if_kind) => self.disable_interface(if_kind),
            DaemonOption::MulticastLoopV4(on) => self.set_multicast_loop_v4(on),
            DaemonOption::MulticastLoopV6(on) => self.set_multicast_loop_v6(on),
        }
    }

    fn enable_interface(&mut self, kinds: Vec<IfKind>) {
        for if_kind in kinds {
            self.if_selections.push(IfSelection {
                if_kind,
                selected: true,
            });
        }

        self.apply_intf_selections(my_ip_interfaces());
    }

    fn disable_interface(&mut self, kinds: Vec<IfKind>) {
        for if_kind in kinds {
            self.if_selections.push(IfSelection {
                if_kind,
                selected: false,
            });
        }

        self.apply_intf_selections(my_ip_interfaces());
    }

    fn set_multicast_loop_v4(&mut self, on: bool) {
        self.multicast_loop_v4 = on;
        for (_, sock) in self.intf_socks.iter_mut() {
            if let Err(e) = sock.set_multicast_loop_v4(on) {
                debug!("failed to set multicast loop v4: {e}");
            }
        }
    }

    fn set_multicast_loop_v6(&mut self, on: bool) {
        self.multicast_loop_v6 = on;
        for (_, sock) in self.intf_socks.iter_mut() {
            if let Err(e) = sock.set_multicast_loop_v6(on) {
                debug!("failed to set multicast loop v6: {e}");
            }
        }
    }

    fn notify_monitors(&mut self, event: DaemonEvent) {
        // Only retain the monitors that are still connected.
        self.monitors.retain(|sender| {
            if let Err(e) = sender.try_send(event.clone()) {
                debug!("notify_monitors: try_send: {}", &e);
                if matches!(e, TrySendError::Disconnected(_)) {
                    return false; // This monitor is dropped.
                }
            }
            true
        });
    }

    /// Remove `addr` in my services that enabled `addr_auto`.
    fn del_addr_in_my_services(&mut self, addr: &IpAddr) {
        for (_, entry) in self.my_services.iter_mut() {
            if entry.info.is_addr_auto() {
                entry.info.remove_ipaddr(addr);
            }
        }
    }

    /// Insert a new interface into the poll map and return key
    fn add_poll(&mut self, intf: Interface) -> usize {
        Self::add_poll_impl(&mut self.poll_ids, &mut self.poll_id_count, intf)
    }

    /// Insert a new interface into the poll map and return its key.
    ///
    /// This exists to satisfy the borrow checker
    fn add_poll_impl(
        poll_ids: &mut HashMap<usize, Interface>,
        poll_id_count: &mut usize,
        intf: Interface,
    ) -> usize {
        let key = *poll_id_count;
        *poll_id_count += 1;
        let _ = (*poll_ids).insert(key, intf);
        key
    }

    /// Apply all selections to `interfaces` and return the selected addresses.
    fn selected_addrs(&self, interfaces: Vec<Interface>) -> HashSet<IpAddr> {
        let intf_count = interfaces.len();
        let mut intf_selections = vec![true; intf_count];

        // apply if_selections
        for selection in self.if_selections.iter() {
            // Mark the interfaces for this selection.
            for i in 0..intf_count {
                if selection.if_kind.matches(&interfaces[i]) {
                    intf_selections[i] = selection.selected;
                }
            }
        }

        let mut selected_addrs = HashSet::new();
        for i in 0..intf_count {
            if intf_selections[i] {
                selected_addrs.insert(interfaces[i].addr.ip());
            }
        }

        selected_addrs
    }

    /// Apply all selections to `interfaces`.
    ///
    /// For any interface, add it if selected but not bound yet,
    /// delete it if not selected but still bound.
    fn apply_intf_selections(&mut self, interfaces: Vec<Interface>) {
        // By default, we enable all interfaces.
        let intf_count = interfaces.len();
        let mut intf_selections = vec![true; intf_count];

        // apply if_selections
        for selection in self.if_selections.iter() {
            // Mark the interfaces for this selection.
            for i in 0..intf_count {
                if selection.if_kind.matches(&interfaces[i]) {
                    intf_selections[i] = selection.selected;
                }
            }
        }

        // Update `intf_socks` based on the selections.
        for (idx, intf) in interfaces.into_iter().enumerate() {
            if intf_selections[idx] {
                // Add the interface
                if !self.intf_socks.contains_key(&intf) {
                    self.add_new_interface(intf);
                }
            } else {
                // Remove the interface
                if let Some(mut sock) = self.intf_socks.remove(&intf) {
                    if let Err(e) = self.poller.registry().deregister(&mut sock) {
                        debug!("process_if_selections: poller.delete {:?}: {}", &intf, e);
                    }
                    // Remove from poll_ids
                    self.poll_ids.retain(|_, v| v != &intf);
                }
            }
        }
    }

    /// Check for IP changes and update intf_socks as needed.
    fn run_ip_check(&mut self, now: u64) {
        // Get the current interfaces.
        let my_ifaddrs = my_ip_interfaces();

        let poll_ids = &mut self.poll_ids;
        let poller = &mut self.poller;
        // Remove unused sockets in the poller.
        let deleted_addrs = self
            .intf_socks
            .iter_mut()
            .filter_map(|(intf, sock)| {
                if !my_ifaddrs.contains(intf) {
                    if let Err(e) = poller.registry().deregister(sock) {
                        debug!("run_ip_check: poller.delete {:?}: {}", intf, e);
                    }
                    // Remove from poll_ids
                    poll_ids.retain(|_, v| v != intf);
                    Some(intf.ip())
                } else {
                    None
                }
            })
            .collect::<Vec<IpAddr>>();

        // Remove deleted addrs from my services that enabled `addr_auto`.
        for ip in deleted_addrs.iter() {
            self.del_addr_in_my_services(ip);
            self.notify_monitors(DaemonEvent::IpDel(*ip));
        }

        // Keep the interfaces only if they still exist.
        self.intf_socks.retain(|intf, _| my_ifaddrs.contains(intf));

        // Add newly found interfaces only if in our selections.
        self.apply_intf_selections(my_ifaddrs);

        self.schedule(now + IP_CHECK_INTERVAL_MILLIS, 0, TaskKind::IpCheck);
    }

    fn add_new_interface(&mut self, intf: Interface) {
        // Bind the new interface.
        let new_ip = intf.ip();
        let should_loop = if new_ip.is_ipv4() {
            self.multicast_loop_v4
        } else {
            self.multicast_loop_v6
        };
        let mut sock = match new_socket_bind(&intf, should_loop) {
            Ok(s) => s,
            Err(e) => {
                debug!("bind a socket to {}: {}. Skipped.", &intf.ip(), e);
                return;
            }
        };

        // Add the new interface into the poller.
        let key = self.add_poll(intf.clone());
        if let Err(e) =
            self.poller
                .registry()
                .register(&mut sock, mio::Token(key), mio::Interest::READABLE)
        {
            debug!("add_new_interface: poller add ip {}: {}", new_ip, e);
            return;
        }

        debug!("add new interface {}: {new_ip}", intf.name);

        for entry in self.my_services.values_mut() {
            if entry.info.is_addr_auto() {
                entry.info.insert_ipaddr(new_ip);
            }
        }

        // Re-announce published services on the new interface.
        for entry in self.my_services.values() {
            if entry.state.is_announced() {
                if let Some(out) = prepare_announce(&entry.info, &intf) {
                    debug!(
                        "Announce service {} on {}",
                        entry.info.get_fullname(),
                        intf.ip()
                    );
                    send_dns_outgoing(&out, &intf, &sock);
                }
            }
        }

        self.intf_socks.insert(intf, sock);

        // Notify the monitors.
        self.notify_monitors(DaemonEvent::IpAdd(new_ip));
    }

    /// Increases the value of `counter` by `count`.
    fn increase_counter(&mut self, counter: Counter, count: i64) {
        let key = counter.to_string();
        match self.counters.get_mut(&key) {
            Some(v) => *v += count,
            None => {
                self.counters.insert(key, count);
            }
        }
    }

    fn signal_sock_drain(&self) {
        let mut signal_buf = [0; 1024];

        // This recv is non-blocking as the socket is non-blocking.
        while let Ok(sz) = self.signal_sock.recv(&mut signal_buf) {
            trace!(
                "signal socket recvd: {}",
                String::from_utf8_lossy(&signal_buf[0..sz])
            );
        }
    }
}

/// Builds the records a service intends to claim: its SRV, its TXT and
/// the address records of its host. Used in the authority section of
/// probe queries.
fn build_service_records(info: &ServiceInfo) -> Vec<DnsRecordBox> {
    let mut records: Vec<DnsRecordBox> = vec![
        Box::new(DnsSrv::new(
            info.get_fullname(),
            CLASS_IN | CLASS_CACHE_FLUSH,
            info.get_host_ttl(),
            info.get_priority(),
            info.get_weight(),
            info.get_port(),
            info.get_hostname().to_string(),
        )),
        Box::new(DnsTxt::new(
            info.get_fullname(),
            CLASS_IN | CLASS_CACHE_FLUSH,
            info.get_other_ttl(),
            info.generate_txt(),
        )),
    ];
    for address in info.get_addresses() {
        records.push(Box::new(DnsAddress::new(
            info.get_hostname(),
            ip_address_rr_type(address),
            CLASS_IN | CLASS_CACHE_FLUSH,
            info.get_host_ttl(),
            *address,
        )));
    }
    records
}

/// Prepares the unsolicited response announcing `info` on `intf`.
///
/// Returns `None` if the service has no address on the LAN of `intf`:
/// we only announce addresses that are valid on the interface.
fn prepare_announce(info: &ServiceInfo, intf: &Interface) -> Option<DnsOutgoing> {
    let intf_addrs = info.get_addrs_on_intf(intf);
    if intf_addrs.is_empty() {
        trace!("No valid addrs to add on intf {:?}", &intf);
        return None;
    }

    let mut out = DnsOutgoing::new(FLAGS_QR_RESPONSE | FLAGS_AA);

    out.add_answer_at_time(
        Box::new(DnsPointer::new(
            info.get_type(),
            RRType::PTR,
            CLASS_IN,
            info.get_other_ttl(),
            info.get_fullname().to_string(),
        )),
        0,
    );

    if let Some(sub) = info.get_subtype() {
        trace!("Adding subdomain {}", sub);
        out.add_answer_at_time(
            Box::new(DnsPointer::new(
                sub,
                RRType::PTR,
                CLASS_IN,
                info.get_other_ttl(),
                info.get_fullname().to_string(),
            )),
            0,
        );
    }

    out.add_answer_at_time(
        Box::new(DnsSrv::new(
            info.get_fullname(),
            CLASS_IN | CLASS_CACHE_FLUSH,
            info.get_host_ttl(),
            info.get_priority(),
            info.get_weight(),
            info.get_port(),
            info.get_hostname().to_string(),
        )),
        0,
    );

    out.add_answer_at_time(
        Box::new(DnsTxt::new(
            info.get_fullname(),
            CLASS_IN | CLASS_CACHE_FLUSH,
            info.get_other_ttl(),
            info.generate_txt(),
        )),
        0,
    );

    for address in intf_addrs {
        out.add_answer_at_time(
            Box::new(DnsAddress::new(
                info.get_hostname(),
                ip_address_rr_type(&address),
                CLASS_IN | CLASS_CACHE_FLUSH,
                info.get_host_ttl(),
                address,
            )),
            0,
        );
    }

    Some(out)
}

/// Adds the goodbye form (TTL 0) of all records of `info` to `out`.
fn add_goodbye_answers(out: &mut DnsOutgoing, info: &ServiceInfo, intf: &Interface) {
    out.add_answer_at_time(
        Box::new(DnsPointer::new(
            info.get_type(),
            RRType::PTR,
            CLASS_IN,
            0,
            info.get_fullname().to_string(),
        )),
        0,
    );

    if let Some(sub) = info.get_subtype() {
        trace!("Adding subdomain {}", sub);
        out.add_answer_at_time(
            Box::new(DnsPointer::new(
                sub,
                RRType::PTR,
                CLASS_IN,
                0,
                info.get_fullname().to_string(),
            )),
            0,
        );
    }

    out.add_answer_at_time(
        Box::new(DnsSrv::new(
            info.get_fullname(),
            CLASS_IN | CLASS_CACHE_FLUSH,
            0,
            info.get_priority(),
            info.get_weight(),
            info.get_port(),
            info.get_hostname().to_string(),
        )),
        0,
    );
    out.add_answer_at_time(
        Box::new(DnsTxt::new(
            info.get_fullname(),
            CLASS_IN | CLASS_CACHE_FLUSH,
            0,
            info.generate_txt(),
        )),
        0,
    );

    for address in info.get_addrs_on_intf(intf) {
        out.add_answer_at_time(
            Box::new(DnsAddress::new(
                info.get_hostname(),
                ip_address_rr_type(&address),
                CLASS_IN | CLASS_CACHE_FLUSH,
                0,
                address,
            )),
            0,
        );
    }
}

/// Adds the PTR answer for `service` and, if it was not suppressed,
/// the recommended additionals into `extras`.
/// See https://tools.ietf.org/html/rfc6763#section-12.1
fn add_answer_with_extras(
    out: &mut DnsOutgoing,
    msg: &DnsIncoming,
    service: &ServiceInfo,
    intf: &Interface,
    extras: &mut Vec<DnsRecordBox>,
) {
    let intf_addrs = service.get_addrs_on_intf(intf);
    if intf_addrs.is_empty() {
        trace!("No addrs on LAN of intf {:?}", intf);
        return;
    }

    let ptr_added = out.add_answer(
        msg,
        Box::new(DnsPointer::new(
            service.get_type(),
            RRType::PTR,
            CLASS_IN,
            service.get_other_ttl(),
            service.get_fullname().to_string(),
        )),
    );

    if !ptr_added {
        trace!("answer was not added for msg {:?}", msg);
        return;
    }

    if let Some(sub) = service.get_subtype() {
        trace!("Adding subdomain {}", sub);
        extras.push(Box::new(DnsPointer::new(
            sub,
            RRType::PTR,
            CLASS_IN,
            service.get_other_ttl(),
            service.get_fullname().to_string(),
        )));
    }

    // Add recommended additional answers according to
    // https://tools.ietf.org/html/rfc6763#section-12.1.
    extras.push(Box::new(DnsSrv::new(
        service.get_fullname(),
        CLASS_IN | CLASS_CACHE_FLUSH,
        service.get_host_ttl(),
        service.get_priority(),
        service.get_weight(),
        service.get_port(),
        service.get_hostname().to_string(),
    )));

    extras.push(Box::new(DnsTxt::new(
        service.get_fullname(),
        CLASS_IN | CLASS_CACHE_FLUSH,
        service.get_host_ttl(),
        service.generate_txt(),
    )));

    for address in intf_addrs {
        extras.push(Box::new(DnsAddress::new(
            service.get_hostname(),
            ip_address_rr_type(&address),
            CLASS_IN | CLASS_CACHE_FLUSH,
            service.get_host_ttl(),
            address,
        )));
    }
}

/// All possible events sent to the client from the daemon
/// regarding service discovery.
#[derive(Debug)]
pub enum ServiceEvent {
    /// Started searching for a service type.
    SearchStarted(String),

    /// Found a specific (service_type, fullname).
    ServiceFound(String, String),

    /// Resolved a service instance with detailed info.
    ServiceResolved(ServiceInfo),

    /// A service instance (service_type, fullname) was removed.
    ServiceRemoved(String, String),

    /// Stopped searching for a service type.
    SearchStopped(String),
}

/// Events sent to the client from the daemon regarding service types.
#[derive(Debug)]
#[non_exhaustive]
pub enum ServiceTypeEvent {
    /// A service type was seen on the network (or registered locally).
    TypeAdded(String),
}

/// Some notable events from the daemon besides [`ServiceEvent`].
/// These events are expected to happen infrequently.
#[derive(Clone, Debug)]
#[non_exhaustive]
pub enum DaemonEvent {
    /// Daemon unsolicitly announced a service from an interface.
    Announce(String, String),

    /// Daemon encountered an error.
    Error(Error),

    /// Daemon detected a new IP address from the host.
    IpAdd(IpAddr),

    /// Daemon detected a IP address removed from the host.
    IpDel(IpAddr),

    /// Daemon resolved a name conflict by changing one of its names.
    /// see [DnsNameChange] for more details.
    NameChange(DnsNameChange),

    /// Send out a multicast response via an IP address.
    Respond(IpAddr),
}

/// Represents a name change due to a name conflict resolution.
/// See [RFC 6762 section 9](https://datatracker.ietf.org/doc/html/rfc6762#section-9)
#[derive(Clone, Debug)]
pub struct DnsNameChange {
    /// The original name set in `ServiceInfo` by the user.
    pub original: String,

    /// A new name is created by appending a suffix after the original name.
    ///
    /// - for a service instance name, the suffix is `(N)`, where N starts at 2.
    /// - for a host name, the suffix is `-N`, where N starts at 2.
    ///
    /// For example:
    ///
    /// - Service name `foo._service-type._udp` becomes `foo (2)._service-type._udp`
    /// - Host name `foo.local.` becomes `foo-2.local.`
    pub new_name: String,

    /// The resource record type
    pub rr_type: RRType,
}

/// Commands supported by the daemon
#[derive(Debug)]
enum Command {
    /// Browsing for a service type (ty_domain, channel::sender)
    Browse(String, Sender<ServiceEvent>),

    /// Browsing for service types on the network.
    BrowseTypes(Sender<ServiceTypeEvent>),

    /// Register a service. Replies when the service is announced.
    Register(ServiceInfo, Sender<Result<()>>),

    /// Unregister a service. Replies when its goodbyes went out.
    Unregister(String, Sender<UnregisterStatus>), // (fullname)

    /// Unregister all services.
    UnregisterAll(Sender<()>),

    /// Stop browsing a service type
    StopBrowse(String), // (ty_domain)

    /// Resolve a service instance: (ty_domain, instance_name, timeout_millis).
    GetServiceInfo(String, String, u64, Sender<Option<ServiceInfo>>),

    /// List the known instances of a service type.
    List(String, Sender<Vec<ServiceInfo>>),

    /// Read the current values of the counters
    GetMetrics(Sender<Metrics>),

    /// Get the current status of the daemon.
    GetStatus(Sender<DaemonStatus>),

    /// Monitor noticable events in the daemon.
    Monitor(Sender<DaemonEvent>),

    SetOption(DaemonOption),

    Exit(Sender<DaemonStatus>),
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Browse(_, _) => write!(f, "Command Browse"),
            Self::BrowseTypes(_) => write!(f, "Command BrowseTypes"),
            Self::Register(_, _) => write!(f, "Command Register"),
            Self::Unregister(_, _) => write!(f, "Command Unregister"),
            Self::UnregisterAll(_) => write!(f, "Command UnregisterAll"),
            Self::StopBrowse(_) => write!(f, "Command StopBrowse"),
            Self::GetServiceInfo(_, _, _, _) => write!(f, "Command GetServiceInfo"),
            Self::List(_, _) => write!(f, "Command List"),
            Self::GetMetrics(_) => write!(f, "Command GetMetrics"),
            Self::GetStatus(_) => write!(f, "Command GetStatus"),
            Self::Monitor(_) => write!(f, "Command Monitor"),
            Self::SetOption(_) => write!(f, "Command SetOption"),
            Self::Exit(_) => write!(f, "Command Exit"),
        }
    }
}

#[derive(Debug)]
enum DaemonOption {
    ServiceNameLenMax(u8),
    EnableInterface(Vec<IfKind>),
    DisableInterface(Vec<IfKind>),
    MulticastLoopV4(bool),
    MulticastLoopV6(bool),
}

/// The length of Service Domain name supported in this lib.
const DOMAIN_LEN: usize = "._tcp.local.".len();

/// Validate the length of "service_name" in a "_<service_name>.<domain_name>." string.
fn check_service_name_length(ty_domain: &str, limit: u8) -> Result<()> {
    if ty_domain.len() <= DOMAIN_LEN + 1 {
        // service name cannot be empty or only '_'.
        return Err(e_fmt!("Service type name cannot be empty: {}", ty_domain));
    }

    let service_name_len = ty_domain.len() - DOMAIN_LEN - 1; // exclude the leading `_`
    if service_name_len > limit as usize {
        return Err(e_fmt!("Service name length must be <= {} bytes", limit));
    }
    Ok(())
}

/// Checks if `name` ends with a valid domain: '._tcp.local.' or '._udp.local.'
fn check_domain_suffix(name: &str) -> Result<()> {
    if !(name.ends_with("._tcp.local.") || name.ends_with("._udp.local.")) {
        return Err(e_fmt!(
            "mDNS service {} must end with '._tcp.local.' or '._udp.local.'",
            name
        ));
    }

    Ok(())
}

/// Validate the service name in a fully qualified name.
///
/// A Full Name = <Instance>.<Service>.<Domain>
/// The only `<Domain>` supported are "._tcp.local." and "._udp.local.".
///
/// Note: this function does not check for the length of the service name.
/// Instead, `register` will check the length.
fn check_service_name(fullname: &str) -> Result<()> {
    check_domain_suffix(fullname)?;

    let remaining: Vec<&str> = fullname[..fullname.len() - DOMAIN_LEN].split('.').collect();
    let name = remaining.last().ok_or_else(|| e_fmt!("No service name"))?;

    if &name[0..1] != "_" {
        return Err(e_fmt!("Service name must start with '_'"));
    }

    let name = &name[1..];

    if name.contains("--") {
        return Err(e_fmt!("Service name must not contain '--'"));
    }

    if name.starts_with('-') || name.ends_with('-') {
        return Err(e_fmt!("Service name may not start or end with '-'"));
    }

    let ascii_count = name.chars().filter(|c| c.is_ascii_alphabetic()).count();
    if ascii_count < 1 {
        return Err(e_fmt!(
            "Service name must contain at least one letter (eg: 'A-Za-z')"
        ));
    }

    Ok(())
}

/// Validate a hostname.
fn check_hostname(hostname: &str) -> Result<()> {
    if !hostname.ends_with(".local.") {
        return Err(e_fmt!("Hostname must end with '.local.': {hostname}"));
    }

    if hostname == ".local." {
        return Err(e_fmt!(
            "The part of the hostname before '.local.' cannot be empty"
        ));
    }

    if hostname.len() > 255 {
        return Err(e_fmt!("Hostname length must be <= 255 bytes"));
    }

    Ok(())
}

fn call_service_listener(
    listeners_map: &HashMap<String, Sender<ServiceEvent>>,
    ty_domain: &str,
    event: ServiceEvent,
) {
    if let Some(listener) = listeners_map.get(ty_domain) {
        match listener.send(event) {
            Ok(()) => trace!("Sent event to listener successfully"),
            Err(e) => debug!("Failed to send event: {}", e),
        }
    }
}

/// Returns valid network interfaces in the host system.
/// Loopback interfaces are excluded.
fn my_ip_interfaces() -> Vec<Interface> {
    if_addrs::get_if_addrs()
        .unwrap_or_default()
        .into_iter()
        .filter(|i| !i.is_loopback())
        .collect()
}

/// Send an outgoing mDNS query or response, and returns the packet bytes.
fn send_dns_outgoing(out: &DnsOutgoing, intf: &Interface, sock: &MioUdpSocket) -> Vec<Vec<u8>> {
    let qtype = if out.is_query() { "query" } else { "response" };
    trace!(
        "send outgoing {}: {} questions {} answers {} authorities {} additional",
        qtype,
        out.questions.len(),
        out.answers_count(),
        out.authorities.len(),
        out.additionals.len()
    );
    let packet_list = out.to_data_on_wire();
    for packet in packet_list.iter() {
        multicast_on_intf(packet, intf, sock);
    }
    packet_list
}

/// Sends a multicast packet out of `intf`.
fn multicast_on_intf(packet: &[u8], intf: &Interface, socket: &MioUdpSocket) {
    if packet.len() > MAX_MSG_ABSOLUTE {
        debug!("Drop over-sized packet ({})", packet.len());
        return;
    }

    let addr: SocketAddr = match intf.addr {
        if_addrs::IfAddr::V4(_) => SocketAddrV4::new(GROUP_ADDR_V4, MDNS_PORT).into(),
        if_addrs::IfAddr::V6(_) => {
            let mut sock = SocketAddrV6::new(GROUP_ADDR_V6, MDNS_PORT, 0, 0);
            sock.set_scope_id(intf.index.unwrap_or(0)); // Choose iface for multicast
            sock.into()
        }
    };

    send_packet(packet, addr, intf, socket);
}

/// Sends out `packet` to `addr` on the socket in `intf_sock`.
fn send_packet(packet: &[u8], addr: SocketAddr, intf: &Interface, sock: &MioUdpSocket) {
    match sock.send_to(packet, addr) {
        Ok(sz) => trace!("sent out {} bytes on interface {:?}", sz, intf),
        Err(e) => debug!("Failed to send to {} via {:?}: {}", addr, &intf, e),
    }
}

/// Returns true if `name` is a valid instance name of format:
/// <instance>.<service_type>.<_udp|_tcp>.local.
/// Note: <instance> could contain '.' as well.
fn valid_instance_name(name: &str) -> bool {
    name.split('.').count() >= 5
}

/// Returns a new instance fullname to avoid a conflict on `fullname`.
///
/// If the instance name already ends with `" (N)"` for some integer N,
/// it is replaced with `" (N+1)"`; otherwise `" (2)"` is appended.
///
/// Examples:
/// - `foo._music._tcp.local.` becomes `foo (2)._music._tcp.local.`
/// - `foo (2)._music._tcp.local.` becomes `foo (3)._music._tcp.local.`
fn name_change(fullname: &str, ty_domain: &str) -> String {
    let instance = fullname
        .strip_suffix(ty_domain)
        .and_then(|s| s.strip_suffix('.'))
        .unwrap_or(fullname);
    format!("{}.{}", increment_name(instance), ty_domain)
}

fn increment_name(name: &str) -> String {
    if let Some(paren_pos) = name.rfind(" (") {
        if let Some(end) = name[paren_pos..].find(')').map(|i| paren_pos + i) {
            // Only increment if the closing parenthesis is the last
            // character and the middle parses as a number.
            if end == name.len() - 1 {
                if let Ok(number) = name[paren_pos + 2..end].parse::<u32>() {
                    return format!("{} ({})", &name[..paren_pos], number + 1);
                }
            }
        }
    }
    format!("{} (2)", name)
}

/// Returns a new hostname to avoid a conflict on `original`.
/// If the name already contains a hyphenated number, increments that number.
///
/// Examples:
/// - `foo.local.` becomes `foo-2.local.`
/// - `foo-2.local.` becomes `foo-3.local.`
/// - `foo` becomes `foo-2`
fn hostname_change(original: &str) -> String {
    let mut parts: Vec<_> = original.split('.').collect();
    let Some(first_part) = parts.get_mut(0) else {
        return format!("{original}-2");
    };

    let mut new_name = format!("{}-2", first_part);

    // check if there is already a `-<num>` suffix
    if let Some(hyphen_pos) = first_part.rfind('-') {
        // Try to parse everything after the hyphen as a number
        if let Ok(number) = first_part[hyphen_pos + 1..].parse::<u32>() {
            let base_name = &first_part[..hyphen_pos];
            new_name = format!("{}-{}", base_name, number + 1);
        }
    }

    *first_part = &new_name;
    parts.join(".")
}

#[cfg(test)]
mod tests {
    use super::{
        check_domain_suffix, check_hostname, check_service_name, check_service_name_length,
        hostname_change, increment_name, name_change, valid_instance_name, ProbeThrottle,
        GROUP_ADDR_V4, MDNS_PORT, PROBE_THROTTLE_LIMIT,
    };
    use std::net::{SocketAddr, SocketAddrV4};
    use test_log::test;

    #[test]
    fn test_socketaddr_print() {
        let addr: SocketAddr = SocketAddrV4::new(GROUP_ADDR_V4, MDNS_PORT).into();
        let print = format!("{}", addr);
        assert_eq!(print, "224.0.0.251:5353");
    }

    #[test]
    fn test_instance_name() {
        assert!(valid_instance_name("my-laser._printer._tcp.local."));
        assert!(valid_instance_name("my-laser.._printer._tcp.local."));
        assert!(!valid_instance_name("_printer._tcp.local."));
    }

    #[test]
    fn test_check_service_name_length() {
        let result = check_service_name_length("_tcp", 100);
        assert!(result.is_err());
        if let Err(e) = result {
            println!("{}", e);
        }
    }

    #[test]
    fn test_check_service_name() {
        assert!(check_service_name("my_inst._music._tcp.local.").is_err()); // no leading '_'
        assert!(check_service_name("_music._tcp.local.").is_ok());
        assert!(check_service_name("_mu--sic._tcp.local.").is_err());
        assert!(check_service_name("_123._udp.local.").is_err()); // needs a letter
    }

    #[test]
    fn test_check_hostname() {
        // valid hostnames
        for hostname in &[
            "my_host.local.",
            &("A".repeat(255 - ".local.".len()) + ".local."),
        ] {
            let result = check_hostname(hostname);
            assert!(result.is_ok());
        }

        // erroneous hostnames
        for hostname in &[
            "my_host.local",
            ".local.",
            &("A".repeat(256 - ".local.".len()) + ".local."),
        ] {
            let result = check_hostname(hostname);
            assert!(result.is_err());
            if let Err(e) = result {
                println!("{}", e);
            }
        }
    }

    #[test]
    fn test_check_domain_suffix() {
        assert!(check_domain_suffix("_missing_dot._tcp.local").is_err());
        assert!(check_domain_suffix("_missing_bar.tcp.local.").is_err());
        assert!(check_domain_suffix("_mis_spell._tpp.local.").is_err());
        assert!(check_domain_suffix("_has_dot._tcp.local.").is_ok());
        assert!(check_domain_suffix("_goodname._udp.local.").is_ok());
    }

    #[test]
    fn test_increment_name() {
        assert_eq!(increment_name("foo"), "foo (2)");
        assert_eq!(increment_name("foo (2)"), "foo (3)");
        assert_eq!(increment_name("foo (9)"), "foo (10)");
        assert_eq!(increment_name(""), " (2)");

        // Additional edge cases
        assert_eq!(increment_name("foo (abc)"), "foo (abc) (2)"); // Invalid number
        assert_eq!(increment_name("foo (2"), "foo (2 (2)"); // Missing closing parenthesis
        assert_eq!(increment_name("foo (2) extra"), "foo (2) extra (2)"); // Extra text after number
    }

    #[test]
    fn test_name_change() {
        assert_eq!(
            name_change("printer._ipp._tcp.local.", "_ipp._tcp.local."),
            "printer (2)._ipp._tcp.local."
        );
        assert_eq!(
            name_change("printer (2)._ipp._tcp.local.", "_ipp._tcp.local."),
            "printer (3)._ipp._tcp.local."
        );
        // The instance may itself contain dots.
        assert_eq!(
            name_change("my.printer._ipp._tcp.local.", "_ipp._tcp.local."),
            "my.printer (2)._ipp._tcp.local."
        );
    }

    #[test]
    fn test_hostname_change() {
        assert_eq!(hostname_change("foo.local."), "foo-2.local.");
        assert_eq!(hostname_change("foo"), "foo-2");
        assert_eq!(hostname_change("foo-2.local."), "foo-3.local.");
        assert_eq!(hostname_change("foo-9"), "foo-10");
        assert_eq!(hostname_change("test-42.domain."), "test-43.domain.");
    }

    #[test]
    fn test_probe_throttle() {
        let mut throttle = ProbeThrottle::new();
        let now = 1_700_000_000_000;

        for i in 1..PROBE_THROTTLE_LIMIT {
            assert!(!throttle.record_probe(now + u64::from(i)), "probe {}", i);
        }
        // The 10th probe within the window trips the throttle.
        assert!(throttle.record_probe(now + 500));

        // A new window resets the counter.
        assert!(!throttle.record_probe(now + 1500));
    }
}
