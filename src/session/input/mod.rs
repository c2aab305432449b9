use crate::messages::{ControlMessage, InteractionMode, MouseButton, NUM_KEYCODES};

pub mod keyboard;
pub mod mouse;

use keyboard::{map_keycode, OsKind, KEY_CAPSLOCK, KEY_NUMLOCK};
use mouse::{scale_absolute, wheel_amount};

/// Contract with the platform input injection backend (uinput, XTest,
/// SendInput). The virtual variant below is used in tests and headless runs.
pub trait InputDevice: Send {
	fn key(&mut self, code: u32, pressed: bool) -> Result<(), ()>;

	fn mouse_button(&mut self, button: MouseButton, pressed: bool) -> Result<(), ()>;

	fn mouse_motion_relative(&mut self, dx: i32, dy: i32) -> Result<(), ()>;

	/// Coordinates are in server screen pixels.
	fn mouse_motion_absolute(&mut self, x: i32, y: i32) -> Result<(), ()>;

	/// High-resolution wheel units, 120 per detent.
	fn mouse_wheel(&mut self, x: i32, y: i32) -> Result<(), ()>;

	fn multigesture(&mut self, _d_theta: f32, _d_dist: f32, _num_fingers: u16) -> Result<(), ()> {
		Ok(())
	}

	fn release_all(&mut self) -> Result<(), ()>;

	fn caps_lock(&self) -> bool;

	fn num_lock(&self) -> bool;

	fn is_pressed(&self, code: u32) -> bool;
}

/// Applies inbound input messages to an [`InputDevice`], enforcing the
/// keyboard ordering rules and the absolute-coordinate normalization.
pub struct InputReplayer {
	device: Box<dyn InputDevice>,
	client_os: OsKind,
	server_os: OsKind,
	screen: (u32, u32),
	last_keyboard_message_id: u32,
	interaction_mode: InteractionMode,
}

impl InputReplayer {
	pub fn new(device: Box<dyn InputDevice>) -> Self {
		Self {
			device,
			client_os: OsKind::Linux,
			server_os: OsKind::Linux,
			screen: (1920, 1080),
			last_keyboard_message_id: 0,
			interaction_mode: InteractionMode::Control,
		}
	}

	pub fn set_client_os(&mut self, client_os: OsKind) {
		self.client_os = client_os;
	}

	pub fn set_screen_size(&mut self, width: u32, height: u32) {
		self.screen = (width, height);
	}

	pub fn set_interaction_mode(&mut self, mode: InteractionMode) {
		tracing::info!("Interaction mode is now {mode:?}.");
		self.interaction_mode = mode;
	}

	pub fn handle(&mut self, message_id: u32, message: &ControlMessage) -> Result<(), ()> {
		if self.interaction_mode == InteractionMode::Spectate {
			tracing::trace!("Spectators don't control the session, dropping input.");
			return Ok(());
		}

		match message {
			ControlMessage::Keyboard { code, pressed, .. } => {
				self.check_keyboard_order(message_id)?;
				let code = map_keycode(self.client_os, self.server_os, *code);
				self.device.key(code, *pressed)
			},
			ControlMessage::KeyboardState { caps_lock, num_lock, pressed } => {
				self.check_keyboard_order(message_id)?;
				self.sync_keyboard_state(*caps_lock, *num_lock, pressed)
			},
			ControlMessage::MouseButton { button, pressed } => self.device.mouse_button(*button, *pressed),
			ControlMessage::MouseMotion { relative, x, y } => {
				if *relative {
					self.device.mouse_motion_relative(*x, *y)
				} else {
					self.device.mouse_motion_absolute(
						scale_absolute(*x, self.screen.0),
						scale_absolute(*y, self.screen.1),
					)
				}
			},
			ControlMessage::MouseWheel { x, y, precise_x, precise_y } => self
				.device
				.mouse_wheel(wheel_amount(*x, *precise_x), wheel_amount(*y, *precise_y)),
			ControlMessage::Multigesture { d_theta, d_dist, num_fingers, .. } => {
				self.device.multigesture(*d_theta, *d_dist, *num_fingers)
			},
			ControlMessage::MouseInactive => Ok(()),
			ControlMessage::ReleaseAllInput => self.device.release_all(),
			message => {
				tracing::warn!("Input replayer received a non-input message: {message:?}");
				Err(())
			},
		}
	}

	/// Keyboard and keyboard-state messages must apply in send order; a
	/// reordered one would leave phantom held keys behind.
	fn check_keyboard_order(&mut self, message_id: u32) -> Result<(), ()> {
		if message_id <= self.last_keyboard_message_id {
			tracing::warn!(
				"Dropping out-of-order keyboard message {message_id} (last applied was {}).",
				self.last_keyboard_message_id
			);
			return Err(());
		}
		self.last_keyboard_message_id = message_id;
		Ok(())
	}

	/// Reconcile the injected device against the client's full keyboard
	/// snapshot: press what the client holds, release what it doesn't, and
	/// bring the lock keys in line with synthetic toggles.
	fn sync_keyboard_state(&mut self, caps_lock: bool, num_lock: bool, pressed: &[bool]) -> Result<(), ()> {
		for (client_code, &wanted) in pressed.iter().enumerate().take(NUM_KEYCODES) {
			let code = map_keycode(self.client_os, self.server_os, client_code as u32);
			// The lock keys toggle state rather than hold it.
			if code == KEY_CAPSLOCK || code == KEY_NUMLOCK {
				continue;
			}
			if self.device.is_pressed(code) != wanted {
				self.device.key(code, wanted)?;
			}
		}

		if self.device.caps_lock() != caps_lock {
			self.device.key(KEY_CAPSLOCK, true)?;
			self.device.key(KEY_CAPSLOCK, false)?;
		}
		if self.device.num_lock() != num_lock {
			self.device.key(KEY_NUMLOCK, true)?;
			self.device.key(KEY_NUMLOCK, false)?;
		}

		Ok(())
	}
}

/// Recorded form of every injected event, for assertions and headless runs.
#[derive(Clone, Debug, PartialEq)]
pub enum ReplayedEvent {
	Key { code: u32, pressed: bool },
	MouseButton { button: MouseButton, pressed: bool },
	MouseMotionRelative { dx: i32, dy: i32 },
	MouseMotionAbsolute { x: i32, y: i32 },
	MouseWheel { x: i32, y: i32 },
	Multigesture { num_fingers: u16 },
	ReleaseAll,
}

/// The virtual input device variant: tracks state and records events instead
/// of touching an OS device.
#[derive(Default)]
pub struct VirtualInputDevice {
	events: Vec<ReplayedEvent>,
	pressed: Vec<u32>,
	buttons: [bool; 6],
	caps_lock: bool,
	num_lock: bool,
}

impl VirtualInputDevice {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn events(&self) -> &[ReplayedEvent] {
		&self.events
	}

	pub fn take_events(&mut self) -> Vec<ReplayedEvent> {
		std::mem::take(&mut self.events)
	}
}

impl InputDevice for VirtualInputDevice {
	fn key(&mut self, code: u32, pressed: bool) -> Result<(), ()> {
		if pressed {
			match code {
				KEY_CAPSLOCK => self.caps_lock = !self.caps_lock,
				KEY_NUMLOCK => self.num_lock = !self.num_lock,
				_ => {},
			}
			if !self.pressed.contains(&code) {
				self.pressed.push(code);
			}
		} else {
			self.pressed.retain(|&held| held != code);
		}

		self.events.push(ReplayedEvent::Key { code, pressed });
		Ok(())
	}

	fn mouse_button(&mut self, button: MouseButton, pressed: bool) -> Result<(), ()> {
		self.buttons[button as usize] = pressed;
		self.events.push(ReplayedEvent::MouseButton { button, pressed });
		Ok(())
	}

	fn mouse_motion_relative(&mut self, dx: i32, dy: i32) -> Result<(), ()> {
		self.events.push(ReplayedEvent::MouseMotionRelative { dx, dy });
		Ok(())
	}

	fn mouse_motion_absolute(&mut self, x: i32, y: i32) -> Result<(), ()> {
		self.events.push(ReplayedEvent::MouseMotionAbsolute { x, y });
		Ok(())
	}

	fn mouse_wheel(&mut self, x: i32, y: i32) -> Result<(), ()> {
		self.events.push(ReplayedEvent::MouseWheel { x, y });
		Ok(())
	}

	fn multigesture(&mut self, _d_theta: f32, _d_dist: f32, num_fingers: u16) -> Result<(), ()> {
		self.events.push(ReplayedEvent::Multigesture { num_fingers });
		Ok(())
	}

	fn release_all(&mut self) -> Result<(), ()> {
		for code in std::mem::take(&mut self.pressed) {
			self.events.push(ReplayedEvent::Key { code, pressed: false });
		}
		for (index, held) in self.buttons.iter_mut().enumerate() {
			if *held {
				*held = false;
				if let Some(button) = MouseButton::from_repr(index as u8) {
					self.events.push(ReplayedEvent::MouseButton { button, pressed: false });
				}
			}
		}
		self.events.push(ReplayedEvent::ReleaseAll);
		Ok(())
	}

	fn caps_lock(&self) -> bool {
		self.caps_lock
	}

	fn num_lock(&self) -> bool {
		self.num_lock
	}

	fn is_pressed(&self, code: u32) -> bool {
		self.pressed.contains(&code)
	}
}

/// A virtual device can be shared so that the session injects through it
/// while a diagnostic (or a test) inspects what was replayed.
impl InputDevice for std::sync::Arc<std::sync::Mutex<VirtualInputDevice>> {
	fn key(&mut self, code: u32, pressed: bool) -> Result<(), ()> {
		self.lock().unwrap().key(code, pressed)
	}

	fn mouse_button(&mut self, button: MouseButton, pressed: bool) -> Result<(), ()> {
		self.lock().unwrap().mouse_button(button, pressed)
	}

	fn mouse_motion_relative(&mut self, dx: i32, dy: i32) -> Result<(), ()> {
		self.lock().unwrap().mouse_motion_relative(dx, dy)
	}

	fn mouse_motion_absolute(&mut self, x: i32, y: i32) -> Result<(), ()> {
		self.lock().unwrap().mouse_motion_absolute(x, y)
	}

	fn mouse_wheel(&mut self, x: i32, y: i32) -> Result<(), ()> {
		self.lock().unwrap().mouse_wheel(x, y)
	}

	fn multigesture(&mut self, d_theta: f32, d_dist: f32, num_fingers: u16) -> Result<(), ()> {
		self.lock().unwrap().multigesture(d_theta, d_dist, num_fingers)
	}

	fn release_all(&mut self) -> Result<(), ()> {
		self.lock().unwrap().release_all()
	}

	fn caps_lock(&self) -> bool {
		self.lock().unwrap().caps_lock()
	}

	fn num_lock(&self) -> bool {
		self.lock().unwrap().num_lock()
	}

	fn is_pressed(&self, code: u32) -> bool {
		self.lock().unwrap().is_pressed(code)
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::messages::MOUSE_SCALING_FACTOR;
	use std::sync::{Arc, Mutex};

	fn shared_replayer() -> (InputReplayer, Arc<Mutex<VirtualInputDevice>>) {
		let device = Arc::new(Mutex::new(VirtualInputDevice::new()));
		(InputReplayer::new(Box::new(device.clone())), device)
	}

	#[test]
	fn keyboard_messages_apply_in_order_only() {
		let (mut replayer, _device) = shared_replayer();

		let press = ControlMessage::Keyboard {
			code: 44,
			modifiers: 0,
			pressed: true,
		};
		assert!(replayer.handle(5, &press).is_ok());
		// An older message must be dropped.
		assert!(replayer.handle(4, &press).is_err());
		// Mouse input is not subject to keyboard ordering.
		assert!(replayer
			.handle(3, &ControlMessage::MouseMotion { relative: true, x: 1, y: 1 })
			.is_ok());
	}

	#[test]
	fn absolute_motion_is_scaled_to_the_server_screen() {
		let (mut replayer, device) = shared_replayer();
		replayer.set_screen_size(2560, 1440);

		replayer
			.handle(
				1,
				&ControlMessage::MouseMotion {
					relative: false,
					x: MOUSE_SCALING_FACTOR / 2,
					y: MOUSE_SCALING_FACTOR / 4,
				},
			)
			.unwrap();

		assert_eq!(
			device.lock().unwrap().events(),
			&[ReplayedEvent::MouseMotionAbsolute { x: 1280, y: 360 }]
		);
	}

	#[test]
	fn keyboard_state_sync_reconciles_held_keys_and_locks() {
		let (mut replayer, device) = shared_replayer();

		// The server already holds key 10; the client holds 4 and caps lock.
		replayer
			.handle(1, &ControlMessage::Keyboard { code: 10, modifiers: 0, pressed: true })
			.unwrap();

		let mut pressed = vec![false; NUM_KEYCODES];
		pressed[4] = true;
		replayer
			.handle(
				2,
				&ControlMessage::KeyboardState {
					caps_lock: true,
					num_lock: false,
					pressed,
				},
			)
			.unwrap();

		let device = device.lock().unwrap();
		assert!(device.is_pressed(4));
		assert!(!device.is_pressed(10));
		assert!(device.caps_lock);
		assert!(!device.num_lock);
	}

	#[test]
	fn spectators_cannot_inject_input() {
		let (mut replayer, device) = shared_replayer();
		replayer.set_interaction_mode(InteractionMode::Spectate);

		replayer
			.handle(1, &ControlMessage::Keyboard { code: 44, modifiers: 0, pressed: true })
			.unwrap();

		assert!(device.lock().unwrap().events().is_empty());
	}

	#[test]
	fn release_all_lifts_keys_and_buttons() {
		let (mut replayer, device) = shared_replayer();

		replayer
			.handle(1, &ControlMessage::Keyboard { code: 44, modifiers: 0, pressed: true })
			.unwrap();
		replayer
			.handle(
				2,
				&ControlMessage::MouseButton {
					button: MouseButton::Left,
					pressed: true,
				},
			)
			.unwrap();
		replayer.handle(3, &ControlMessage::ReleaseAllInput).unwrap();

		let device = device.lock().unwrap();
		assert!(!device.is_pressed(44));
		assert!(device.events().contains(&ReplayedEvent::ReleaseAll));
	}
}
