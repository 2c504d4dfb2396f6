//! A small CoAP node over the stack.
//!
//! Raw IP frames travel inside UDP datagrams between two node instances
//! (`node <local> <peer> [host-v4]`), so a pair of processes on one
//! machine can ping each other and poll each other's resources. One actor
//! owns the whole data plane: the socket tap, the IP/UDP stack, the CoAP
//! engine with a few resources, and the settings registry the node boots
//! its configuration from.

use core::cell::{Cell, RefCell};
use core::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::net::UdpSocket;
use std::rc::Rc;
use std::time::Instant;

use coap::rest::{flags, Resource};
use coap::{Context, Transport};
use log::{error, info};
use net::config::PERIODIC_INTERVAL;
use net::ip::SocketAddr;
use net::udp::AssocId;
use net::Stack;
use runtime::Io;
use settings::{read_value, Error, Handler, Reader, Settings};
use stakker::{actor, fwd_to, ret_nop, Cx, Fwd, CX};

mod flash;

const COAP_PORT: u16 = coap::config::DEFAULT_PORT;

/// Outbound CoAP datagrams, staged until the stack's UDP layer sends them.
#[derive(Clone, Default)]
struct QueueTransport {
	queue: Rc<RefCell<Vec<(SocketAddr, Vec<u8>)>>>,
}

impl Transport for QueueTransport {
	fn send(&mut self, to: SocketAddr, data: &[u8]) -> Result<(), ()> {
		self.queue.borrow_mut().push((to, data.to_vec()));
		Ok(())
	}
}

/// Applies the persisted `app/...` subtree to the node.
struct AppConfig {
	greeting: Rc<RefCell<String>>,
}

impl Handler for AppConfig {
	fn name(&self) -> &str {
		"app"
	}

	fn set(&mut self, key: &str, value: &mut dyn Reader) -> Result<(), Error> {
		match key {
			"greeting" => {
				let v = read_value(value)?;
				*self.greeting.borrow_mut() = String::from_utf8(v).map_err(|_| Error::Corrupt)?;
				Ok(())
			}
			_ => Ok(()),
		}
	}

	fn export(&mut self, save: &mut dyn FnMut(&str, &[u8]) -> Result<(), Error>) -> Result<(), Error> {
		save("app/greeting", self.greeting.borrow().as_bytes())
	}

	fn get(&mut self, key: &str, buf: &mut [u8]) -> Result<usize, Error> {
		if key != "greeting" {
			return Err(Error::NotFound);
		}

		let greeting = self.greeting.borrow();
		let v = greeting.as_bytes();

		if v.len() > buf.len() {
			return Err(Error::TooLarge);
		}

		buf[..v.len()].copy_from_slice(v);
		Ok(v.len())
	}
}

/// Boots the configuration from the settings log, then writes the (maybe
/// default) values back so the next boot sees them.
fn load_config(greeting: &Rc<RefCell<String>>) {
	let store = match settings::fcb::FcbStore::new(flash::RamFlash::new(4, 1024)) {
		Ok(s) => s,
		Err(err) => return error!("settings: storage unavailable: {err:?}"),
	};

	let mut registry = Settings::new();
	let id = registry.src_register(Box::new(store));
	registry.dst_register(id);

	if let Err(err) = registry.register(Box::new(AppConfig { greeting: greeting.clone() })) {
		return error!("settings: handler registration failed: {err:?}");
	}

	if let Err(err) = registry.load() {
		error!("settings: load failed: {err:?}");
	}

	if let Err(err) = registry.save() {
		error!("settings: save failed: {err:?}");
	}
}

struct Node {
	io: Io<UdpSocket>,
	stack: Stack<Fwd<Box<[u8]>>>,
	coap: Context<QueueTransport>,
	assoc: AssocId,
	/// Datagrams the stack's UDP layer delivered for the engine.
	inbox: Rc<RefCell<Vec<(SocketAddr, Vec<u8>)>>>,
	/// Datagrams the engine produced for the stack.
	outbox: Rc<RefCell<Vec<(SocketAddr, Vec<u8>)>>>,
	clock: Rc<Cell<u32>>,
	epoch: Instant,
}

impl Node {
	fn init(cx: CX![], socket: UdpSocket, host4: Ipv4Addr) -> Option<Self> {
		let io = Io::new(socket, fwd_to!([cx], frame() as (Box<[u8]>)));

		let link = fwd_to!([cx], transmit() as (Box<[u8]>));
		let mut stack = Stack::new(host4, Ipv6Addr::new(0xfd00, 0, 0, 0, 0, 0, 0, 1), link);

		let inbox: Rc<RefCell<Vec<(SocketAddr, Vec<u8>)>>> = Rc::default();
		let sink = inbox.clone();
		let assoc = stack.udp_new(
			IpAddr::V4(Ipv4Addr::UNSPECIFIED),
			0,
			Box::new(move |ev, _| sink.borrow_mut().push((ev.src, ev.data.to_vec()))),
		)?;
		stack.udp_bind(assoc, COAP_PORT);

		let transport = QueueTransport::default();
		let outbox = transport.queue.clone();
		let mut coap = Context::new(transport);

		let greeting = Rc::new(RefCell::new(String::from("hello from the node")));
		let clock = Rc::new(Cell::new(0u32));

		load_config(&greeting);

		let text = greeting.clone();
		coap.activate(
			Resource::new("greeting", flags::METHOD_GET)
				.attributes(";rt=\"text\"")
				.get(Box::new(move |_, resp, _, _, _| {
					resp.set_payload(text.borrow().as_bytes());
				})),
		);

		let ticks = clock.clone();
		coap.activate(
			Resource::new("clock", flags::METHOD_GET | flags::IS_OBSERVABLE)
				.attributes(";rt=\"clock\";obs")
				.periodic(10_000)
				.get(Box::new(move |_, resp, _, _, _| {
					resp.set_payload(format!("{}", ticks.get()).as_bytes());
				})),
		);

		info!("serving coap on {host4}:{COAP_PORT}");

		let actor = cx.access_actor().clone();
		cx.after(PERIODIC_INTERVAL, move |s| actor.apply(s, |this, cx| this.tick(cx)));

		Some(Self {
			io,
			stack,
			coap,
			assoc,
			inbox,
			outbox,
			clock,
			epoch: cx.now(),
		})
	}

	fn now(&self, cx: &mut Cx<'_, Self>) -> u64 {
		(cx.now() - self.epoch).as_millis() as u64
	}

	/// One tunnel frame in from the socket.
	fn frame(&mut self, cx: CX![], frame: Box<[u8]>) {
		self.stack.input(&frame);
		self.pump(cx);
	}

	/// One stack frame out to the socket.
	fn transmit(&mut self, _: CX![], frame: Box<[u8]>) {
		let _ = self.io.write(|cur| {
			let _ = cur.push(&frame);
		});
	}

	/// Moves datagrams between the stack's UDP layer and the engine until
	/// both queues drain.
	fn pump(&mut self, cx: CX![]) {
		let now = self.now(cx);

		loop {
			let datagrams: Vec<_> = self.inbox.borrow_mut().drain(..).collect();
			let replies: Vec<_> = self.outbox.borrow_mut().drain(..).collect();

			if datagrams.is_empty() && replies.is_empty() {
				break;
			}

			for (from, data) in datagrams {
				self.coap.receive(from, &data, now);
			}

			for (to, data) in replies {
				let _ = self.stack.udp_send(self.assoc, to, &data);
			}
		}
	}

	fn tick(&mut self, cx: CX![]) {
		self.stack.periodic();
		self.clock.set(runtime::time::unix(cx));

		let now = self.now(cx);
		self.coap.check_transactions(now);
		self.coap.poll_periodic(now);
		self.pump(cx);

		let actor = cx.access_actor().clone();
		cx.after(PERIODIC_INTERVAL, move |s| actor.apply(s, |this, cx| this.tick(cx)));
	}
}

fn main() {
	runtime::logger::init();

	let mut args = std::env::args().skip(1);
	let local = args.next().unwrap_or_else(|| String::from("127.0.0.1:9400"));
	let peer = args.next().unwrap_or_else(|| String::from("127.0.0.1:9401"));
	let host4 = args.next().and_then(|a| a.parse().ok()).unwrap_or(Ipv4Addr::new(10, 0, 0, 1));

	let socket = match UdpSocket::bind(local.as_str()) {
		Ok(s) => s,
		Err(err) => return error!("failed to bind {local}: {err}"),
	};

	if let Err(err) = socket.set_nonblocking(true).and_then(|()| socket.connect(peer.as_str())) {
		return error!("failed to connect tunnel to {peer}: {err}");
	}

	info!("tunnel {local} -> {peer}, host address {host4}");

	let mut stakker = runtime::init();
	let node = actor!(stakker, Node::init(socket, host4), ret_nop!());

	if runtime::exec(&mut stakker, move || drop(node)).is_err() {
		error!("runtime loop failed");
	}
}
