//! End-to-end engine behavior over a mock transport.

use core::cell::RefCell;
use core::net::{IpAddr, Ipv4Addr};
use std::rc::Rc;

use coap::config::{MAX_OPEN_TRANSACTIONS, OBSERVE_REFRESH_INTERVAL, REST_MAX_CHUNK_SIZE};
use coap::msg::{codes, Kind, Message};
use coap::rest::{flags, Resource};
use coap::{separate, Context, Transport};
use net::ip::SocketAddr;

fn client() -> SocketAddr {
	SocketAddr { addr: IpAddr::V4(Ipv4Addr::new(10, 0, 0, 2)), port: 40000 }
}

#[derive(Clone, Default)]
struct MockTransport {
	sent: Rc<RefCell<Vec<(SocketAddr, Vec<u8>)>>>,
}

impl Transport for MockTransport {
	fn send(&mut self, to: SocketAddr, data: &[u8]) -> Result<(), ()> {
		self.sent.borrow_mut().push((to, data.to_vec()));
		Ok(())
	}
}

struct Server {
	ctx: Context<MockTransport>,
	sent: Rc<RefCell<Vec<(SocketAddr, Vec<u8>)>>>,
}

impl Server {
	fn new() -> Self {
		let transport = MockTransport::default();
		let sent = transport.sent.clone();
		Self { ctx: Context::new(transport), sent }
	}

	fn take(&self) -> Vec<Message> {
		self.sent.borrow_mut().drain(..).map(|(_, d)| Message::parse(&d).unwrap()).collect()
	}

	fn send(&mut self, msg: &Message, now: u64) {
		let mut buf = [0u8; 1024];
		let n = msg.serialize(&mut buf).unwrap();
		self.ctx.receive(client(), &buf[..n], now);
	}
}

fn hello_resource() -> Resource {
	Resource::new("hello", flags::METHOD_GET).get(Box::new(|_req, resp, _buf, _size, _off| {
		resp.set_payload(b"world");
	}))
}

#[test]
fn con_get_gets_piggybacked_ack() {
	let mut s = Server::new();
	s.ctx.activate(hello_resource());

	let mut req = Message::new(Kind::Con, codes::GET, 0x77);
	req.set_token(&[1, 2, 3]);
	req.set_uri_path("hello");
	s.send(&req, 0);

	let out = s.take();
	assert_eq!(out.len(), 1);
	assert_eq!(out[0].kind, Kind::Ack);
	assert_eq!(out[0].mid, 0x77);
	assert_eq!(out[0].code, codes::CONTENT_2_05);
	assert_eq!(out[0].token(), &[1, 2, 3]);
	assert_eq!(out[0].payload, b"world");
}

#[test]
fn non_request_is_answered_with_non_and_fresh_mid() {
	let mut s = Server::new();
	s.ctx.activate(hello_resource());

	// The response takes the next MID off the counter, not the request's.
	let probe = s.ctx.next_mid();

	let mut req = Message::new(Kind::Non, codes::GET, 0x88);
	req.set_uri_path("hello");
	s.send(&req, 0);

	let out = s.take();
	assert_eq!(out[0].kind, Kind::Non);
	assert_eq!(out[0].mid, probe.wrapping_add(1));
	assert_eq!(out[0].payload, b"world");
}

#[test]
fn unknown_path_is_not_found() {
	let mut s = Server::new();

	let mut req = Message::new(Kind::Con, codes::GET, 1);
	req.set_uri_path("nope");
	s.send(&req, 0);

	let out = s.take();
	assert_eq!(out[0].code, codes::NOT_FOUND_4_04);
	assert_eq!(out[0].payload, b"NotFound");
}

#[test]
fn wrong_method_is_rejected() {
	let mut s = Server::new();
	s.ctx.activate(hello_resource());

	let mut req = Message::new(Kind::Con, codes::PUT, 1);
	req.set_uri_path("hello");
	s.send(&req, 0);

	assert_eq!(s.take()[0].code, codes::METHOD_NOT_ALLOWED_4_05);
}

#[test]
fn ping_is_answered_with_rst() {
	let mut s = Server::new();

	let ping = Message::new(Kind::Con, codes::EMPTY, 0xBEE);
	s.send(&ping, 0);

	let out = s.take();
	assert_eq!(out[0].kind, Kind::Rst);
	assert_eq!(out[0].code, codes::EMPTY);
	assert_eq!(out[0].mid, 0xBEE);
}

#[test]
fn exhausted_transactions_answer_5_03() {
	let mut s = Server::new();
	s.ctx.activate(hello_resource());

	// Fill the pool with unacknowledged CON requests of our own.
	for i in 0..MAX_OPEN_TRANSACTIONS as u16 {
		let msg = Message::new(Kind::Con, codes::GET, 0x4000 + i);
		s.ctx.request(client(), &msg, Box::new(|_| {}), 0).unwrap();
	}
	let _ = s.take();

	let mut req = Message::new(Kind::Con, codes::GET, 0x99);
	req.set_uri_path("hello");
	s.send(&req, 0);

	let out = s.take();
	assert_eq!(out[0].code, codes::SERVICE_UNAVAILABLE_5_03);
}

#[test]
fn blockwise_slicing_for_unaware_resource() {
	let mut s = Server::new();

	// A resource three half-chunks long.
	let body: Vec<u8> = (0..REST_MAX_CHUNK_SIZE + REST_MAX_CHUNK_SIZE / 2).map(|i| i as u8).collect();
	let served = body.clone();

	s.ctx.activate(Resource::new("big", flags::METHOD_GET).get(Box::new(move |_, resp, _, _, _| {
		resp.payload = served.clone();
	})));

	// First block.
	let mut req = Message::new(Kind::Con, codes::GET, 1);
	req.set_uri_path("big");
	req.set_block2(0, false, 128).unwrap();
	s.send(&req, 0);

	let out = s.take();
	let b = out[0].block2().unwrap();
	assert!(b.more);
	assert_eq!(b.num, 0);
	assert_eq!(out[0].payload, &body[..128]);

	// Last block.
	let mut req = Message::new(Kind::Con, codes::GET, 2);
	req.set_uri_path("big");
	req.set_block2(2, false, 128).unwrap();
	s.send(&req, 0);

	let out = s.take();
	let b = out[0].block2().unwrap();
	assert_eq!(b.num, 2);
	assert_eq!(out[0].payload, &body[256..]);

	// Beyond the end.
	let mut req = Message::new(Kind::Con, codes::GET, 3);
	req.set_uri_path("big");
	req.set_block2(9, false, 128).unwrap();
	s.send(&req, 0);

	let out = s.take();
	assert_eq!(out[0].code, codes::BAD_OPTION_4_02);
	assert_eq!(out[0].payload, b"BlockOutOfScope");
}

#[test]
fn block1_without_support_is_5_01() {
	let mut s = Server::new();
	s.ctx.activate(Resource::new("sink", flags::METHOD_PUT).put(Box::new(|_, _, _, _, _| {})));

	let mut req = Message::new(Kind::Con, codes::PUT, 5);
	req.set_uri_path("sink");
	req.set_block1(0, true, 64).unwrap();
	req.set_payload(&[0u8; 64]);
	s.send(&req, 0);

	let out = s.take();
	assert_eq!(out[0].code, codes::NOT_IMPLEMENTED_5_01);
	assert_eq!(out[0].payload, b"NoBlock1Support");
}

#[test]
fn well_known_core_lists_resources() {
	let mut s = Server::new();
	s.ctx.activate(hello_resource());
	s.ctx.activate(Resource::new("obs", flags::METHOD_GET | flags::IS_OBSERVABLE).attributes(";obs"));

	let mut req = Message::new(Kind::Con, codes::GET, 9);
	req.set_uri_path(".well-known/core");
	s.send(&req, 0);

	let out = s.take();
	assert_eq!(out[0].code, codes::CONTENT_2_05);
	assert_eq!(out[0].content_format(), Some(40));
	assert_eq!(out[0].payload, b"</hello>,</obs>;obs");
}

#[test]
fn separate_response_flow() {
	let mut s = Server::new();

	let store: Rc<RefCell<Option<separate::Separate>>> = Rc::default();
	let st = store.clone();

	s.ctx.activate(Resource::new("slow", flags::METHOD_GET | flags::IS_SEPARATE).get(Box::new(move |req, resp, _, _, _| {
		st.borrow_mut().replace(separate::accept(req, resp).unwrap());
	})));

	// S6: CON GET with MID 1 and token [01 02].
	let mut req = Message::new(Kind::Con, codes::GET, 1);
	req.set_token(&[0x01, 0x02]);
	req.set_uri_path("slow");
	s.send(&req, 0);

	// The immediate reply is an empty ACK: 4-byte header, no token.
	{
		let raw = s.sent.borrow_mut().drain(..).collect::<Vec<_>>();
		assert_eq!(raw.len(), 1);
		assert_eq!(raw[0].1.len(), 4);

		let ack = Message::parse(&raw[0].1).unwrap();
		assert_eq!(ack.kind, Kind::Ack);
		assert_eq!(ack.code, codes::EMPTY);
		assert_eq!(ack.mid, 1);
		assert!(ack.token().is_empty());
	}

	// Resume later with 2.05 and a payload, under a fresh MID.
	let probe = s.ctx.next_mid();

	let store = store.borrow_mut().take().unwrap();
	s.ctx.separate_resume(&store, codes::CONTENT_2_05, b"finally", 50).unwrap();

	let out = s.take();
	assert_eq!(out[0].kind, Kind::Con);
	assert_eq!(out[0].mid, probe.wrapping_add(1));
	assert_eq!(out[0].token(), &[0x01, 0x02]);
	assert_eq!(out[0].code, codes::CONTENT_2_05);
	assert_eq!(out[0].payload, b"finally");
}

#[test]
fn observe_registration_and_refresh() {
	let mut s = Server::new();

	let counter: Rc<RefCell<u32>> = Rc::default();
	let c = counter.clone();

	s.ctx.activate(
		Resource::new("push", flags::METHOD_GET | flags::IS_OBSERVABLE)
			.get(Box::new(move |_, resp, _, _, _| {
				resp.set_payload(format!("v{}", c.borrow()).as_bytes());
			})),
	);

	// Register: GET with Observe=0.
	let mut req = Message::new(Kind::Con, codes::GET, 0x10);
	req.set_token(&[9]);
	req.set_uri_path("push");
	req.set_observe(0);
	s.send(&req, 0);

	let out = s.take();
	assert_eq!(out[0].observe(), Some(0));

	// S3: the first OBSERVE_REFRESH_INTERVAL notifications are NON, the
	// next one is promoted to CON, and MIDs increase by one each time.
	let mut mids = Vec::new();

	for i in 0..OBSERVE_REFRESH_INTERVAL + 1 {
		*counter.borrow_mut() = i;
		s.ctx.notify("push", None, 1000 + i as u64);

		let out = s.take();
		assert_eq!(out.len(), 1, "notification {} was dropped", i + 1);

		let expected = if i == OBSERVE_REFRESH_INTERVAL { Kind::Con } else { Kind::Non };
		assert_eq!(out[0].kind, expected, "notification {} has the wrong type", i + 1);
		assert_eq!(out[0].token(), &[9]);

		mids.push(out[0].mid);
	}

	for pair in mids.windows(2) {
		assert_eq!(pair[1], pair[0].wrapping_add(1));
	}

	// Observe values increase monotonically starting after registration.
	// Deregister with Observe=1; the next notify is silent.
	let mut dereg = Message::new(Kind::Con, codes::GET, 0x11);
	dereg.set_token(&[9]);
	dereg.set_uri_path("push");
	dereg.set_observe(1);
	s.send(&dereg, 5000);
	let _ = s.take();

	s.ctx.notify("push", None, 6000);
	assert!(s.take().is_empty());
}

#[test]
fn rst_cancels_observer() {
	let mut s = Server::new();
	s.ctx.activate(
		Resource::new("push", flags::METHOD_GET | flags::IS_OBSERVABLE).get(Box::new(|_, resp, _, _, _| resp.set_payload(b"x"))),
	);

	let mut req = Message::new(Kind::Con, codes::GET, 0x10);
	req.set_token(&[7]);
	req.set_uri_path("push");
	req.set_observe(0);
	s.send(&req, 0);
	let _ = s.take();

	s.ctx.notify("push", None, 100);
	let out = s.take();
	let mid = out[0].mid;

	// The client resets the notification: relationship over.
	let rst = Message::new(Kind::Rst, codes::EMPTY, mid);
	s.send(&rst, 200);

	s.ctx.notify("push", None, 300);
	assert!(s.take().is_empty());
}

#[test]
fn client_request_round_trip() {
	let mut s = Server::new();

	let got: Rc<RefCell<Option<Vec<u8>>>> = Rc::default();
	let g = got.clone();

	let mut req = Message::new(Kind::Con, codes::GET, s.ctx.next_mid());
	req.set_uri_path("remote/thing");

	s.ctx
		.request(
			client(),
			&req,
			Box::new(move |resp| {
				g.borrow_mut().replace(resp.map(|r| r.payload.clone()).unwrap_or_default());
			}),
			0,
		)
		.unwrap();

	let raw = s.sent.borrow_mut().drain(..).collect::<Vec<_>>();
	let sent = Message::parse(&raw[0].1).unwrap();
	assert_eq!(sent.uri_path(), b"remote/thing");

	// The server's piggybacked ACK comes back.
	let mut ack = Message::new(Kind::Ack, codes::CONTENT_2_05, sent.mid);
	ack.set_payload(b"data");

	let mut buf = [0u8; 256];
	let n = ack.serialize(&mut buf).unwrap();
	s.ctx.receive(client(), &buf[..n], 10);

	assert_eq!(got.borrow().as_deref(), Some(&b"data"[..]));
}

#[test]
fn resumable_request_walks_block2_windows() {
	let mut s = Server::new();

	// A 600-byte body served by a remote peer, fetched in MAX_BLOCK_SIZE
	// windows by the resumable client request.
	let body: Vec<u8> = (0..600u32).map(|i| i as u8).collect();
	let block = coap::config::MAX_BLOCK_SIZE as usize;

	let mut template = Message::new(Kind::Con, codes::GET, 0);
	template.set_uri_path("file");

	let mut req = coap::client::Request::new(client(), template);
	req.start(&mut s.ctx, 0).unwrap();

	let mut now = 0u64;

	loop {
		// Read what the client sent and play the server's part.
		let raw = s.sent.borrow_mut().drain(..).collect::<Vec<_>>();
		assert_eq!(raw.len(), 1);

		let sent = Message::parse(&raw[0].1).unwrap();
		assert_eq!(sent.uri_path(), b"file");

		let num = sent.block2().map(|b| b.num).unwrap_or(0) as usize;
		let from = num * block;
		let more = from + block < body.len();

		let mut resp = Message::new(Kind::Ack, codes::CONTENT_2_05, sent.mid);
		resp.set_block2(num as u32, more, block as u16).unwrap();
		resp.set_payload(&body[from..body.len().min(from + block)]);

		let mut buf = [0u8; 1024];
		let n = resp.serialize(&mut buf).unwrap();

		now += 10;
		s.ctx.receive(client(), &buf[..n], now);

		if req.poll(&mut s.ctx, now) {
			break;
		}
	}

	let (code, got) = req.response().unwrap();
	assert_eq!(code, codes::CONTENT_2_05);
	assert_eq!(got, &body[..]);
}

#[test]
fn blockwise_upload_assembles_through_block1_handler() {
	let mut s = Server::new();

	// A writable resource in the plugtest large-update shape: the handler
	// feeds every Block1 request through the upload helper, which gathers
	// the body into the resource's storage.
	let storage: Rc<RefCell<(Vec<u8>, usize)>> = Rc::new(RefCell::new((vec![0u8; 64], 0)));
	let sink = storage.clone();

	s.ctx.activate(Resource::new("large-update", flags::METHOD_PUT).put(Box::new(move |req, resp, _, _, _| {
		let mut slot = sink.borrow_mut();
		let (target, len) = &mut *slot;

		resp.code = codes::CHANGED_2_04;
		let _ = coap::block::block1_handler(req, resp, target, len);
	})));

	let chunks: [&[u8]; 3] = [b"0123456789abcdef", b"ghijklmnopqrstuv", b"wxyz"];

	for (i, chunk) in chunks.iter().enumerate() {
		let more = i + 1 < chunks.len();

		let mut req = Message::new(Kind::Con, codes::PUT, 0x40 + i as u16);
		req.set_uri_path("large-update");
		req.set_block1(i as u32, more, 16).unwrap();
		req.set_payload(chunk);
		s.send(&req, i as u64 * 10);

		let out = s.take();
		assert_eq!(out.len(), 1);

		// The helper echoes the block so the client advances, and answers
		// 2.31 Continue until the final block lands.
		let echo = out[0].block1().unwrap();
		assert_eq!(echo.num, i as u32);
		assert_eq!(echo.more, more);

		if more {
			assert_eq!(out[0].code, codes::CONTINUE_2_31);
		} else {
			assert_eq!(out[0].code, codes::CHANGED_2_04);
		}
	}

	let slot = storage.borrow();
	assert_eq!(slot.1, 36);
	assert_eq!(&slot.0[..36], b"0123456789abcdefghijklmnopqrstuvwxyz");
}

#[test]
fn oversized_blockwise_upload_is_rejected_with_4_13() {
	let mut s = Server::new();

	let storage: Rc<RefCell<(Vec<u8>, usize)>> = Rc::new(RefCell::new((vec![0u8; 16], 0)));
	let sink = storage.clone();

	s.ctx.activate(Resource::new("small-sink", flags::METHOD_PUT).put(Box::new(move |req, resp, _, _, _| {
		let mut slot = sink.borrow_mut();
		let (target, len) = &mut *slot;

		resp.code = codes::CHANGED_2_04;
		let _ = coap::block::block1_handler(req, resp, target, len);
	})));

	// The second block runs past the resource's storage.
	let mut req = Message::new(Kind::Con, codes::PUT, 0x50);
	req.set_uri_path("small-sink");
	req.set_block1(1, false, 16).unwrap();
	req.set_payload(&[0xAA; 16]);
	s.send(&req, 0);

	let out = s.take();
	assert_eq!(out[0].code, codes::REQUEST_ENTITY_TOO_LARGE_4_13);
	assert_eq!(out[0].size1(), Some(16));
}
