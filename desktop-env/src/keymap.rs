// Copyright 2024 desktop-env Authors
// SPDX-License-Identifier: Apache-2.0

//! Key code translation
//!
//! Every event and injector in this crate speaks Windows virtual-key
//! numbering. Backends translate at their edge: identity on Win32, keysym
//! lookups on X11.

/// Virtual-key codes
pub mod vk {
    pub const BACK: u32 = 0x08;
    pub const TAB: u32 = 0x09;
    pub const RETURN: u32 = 0x0D;
    pub const SHIFT: u32 = 0x10;
    pub const CONTROL: u32 = 0x11;
    pub const MENU: u32 = 0x12;
    pub const ESCAPE: u32 = 0x1B;
    pub const SPACE: u32 = 0x20;
    pub const LEFT: u32 = 0x25;
    pub const UP: u32 = 0x26;
    pub const RIGHT: u32 = 0x27;
    pub const DOWN: u32 = 0x28;
    pub const DELETE: u32 = 0x2E;
    pub const KEY_0: u32 = 0x30;
    pub const KEY_9: u32 = 0x39;
    pub const KEY_A: u32 = 0x41;
    pub const KEY_Z: u32 = 0x5A;
    pub const F1: u32 = 0x70;
    pub const F12: u32 = 0x7B;
}

/// Keysym values used by the X11 translation
mod keysym {
    pub const BACKSPACE: u32 = 0xff08;
    pub const TAB: u32 = 0xff09;
    pub const RETURN: u32 = 0xff0d;
    pub const ESCAPE: u32 = 0xff1b;
    pub const LEFT: u32 = 0xff51;
    pub const UP: u32 = 0xff52;
    pub const RIGHT: u32 = 0xff53;
    pub const DOWN: u32 = 0xff54;
    pub const F1: u32 = 0xffbe;
    pub const F12: u32 = 0xffc9;
    pub const SHIFT_L: u32 = 0xffe1;
    pub const SHIFT_R: u32 = 0xffe2;
    pub const CONTROL_L: u32 = 0xffe3;
    pub const CONTROL_R: u32 = 0xffe4;
    pub const ALT_L: u32 = 0xffe9;
    pub const ALT_R: u32 = 0xffea;
    pub const DELETE: u32 = 0xffff;
    pub const LOWER_A: u32 = 0x61;
    pub const LOWER_Z: u32 = 0x7a;
}

/// Virtual key that types `c`, if it has one.
///
/// Letters map to their upper-case code regardless of case; shifted
/// symbols and non-ASCII characters have no mapping.
pub fn char_to_vk(c: char) -> Option<u32> {
    match c {
        'a'..='z' | 'A'..='Z' => Some(c.to_ascii_uppercase() as u32),
        '0'..='9' => Some(c as u32),
        ' ' => Some(vk::SPACE),
        '\n' => Some(vk::RETURN),
        '\t' => Some(vk::TAB),
        _ => None,
    }
}

/// Translate an X11 keysym to a virtual key.
pub fn keysym_to_vk(sym: u32) -> Option<u32> {
    let vk = match sym {
        keysym::LOWER_A..=keysym::LOWER_Z => sym - keysym::LOWER_A + vk::KEY_A,
        vk::KEY_A..=vk::KEY_Z | vk::KEY_0..=vk::KEY_9 | vk::SPACE => sym,
        keysym::F1..=keysym::F12 => sym - keysym::F1 + vk::F1,
        keysym::BACKSPACE => vk::BACK,
        keysym::TAB => vk::TAB,
        keysym::RETURN => vk::RETURN,
        keysym::ESCAPE => vk::ESCAPE,
        keysym::LEFT => vk::LEFT,
        keysym::UP => vk::UP,
        keysym::RIGHT => vk::RIGHT,
        keysym::DOWN => vk::DOWN,
        keysym::DELETE => vk::DELETE,
        keysym::SHIFT_L | keysym::SHIFT_R => vk::SHIFT,
        keysym::CONTROL_L | keysym::CONTROL_R => vk::CONTROL,
        keysym::ALT_L | keysym::ALT_R => vk::MENU,
        _ => return None,
    };
    Some(vk)
}

/// Translate a virtual key to the X11 keysym that produces it.
pub fn vk_to_keysym(code: u32) -> Option<u32> {
    let sym = match code {
        vk::KEY_A..=vk::KEY_Z => code - vk::KEY_A + keysym::LOWER_A,
        vk::KEY_0..=vk::KEY_9 | vk::SPACE => code,
        vk::F1..=vk::F12 => code - vk::F1 + keysym::F1,
        vk::BACK => keysym::BACKSPACE,
        vk::TAB => keysym::TAB,
        vk::RETURN => keysym::RETURN,
        vk::ESCAPE => keysym::ESCAPE,
        vk::LEFT => keysym::LEFT,
        vk::UP => keysym::UP,
        vk::RIGHT => keysym::RIGHT,
        vk::DOWN => keysym::DOWN,
        vk::DELETE => keysym::DELETE,
        vk::SHIFT => keysym::SHIFT_L,
        vk::CONTROL => keysym::CONTROL_L,
        vk::MENU => keysym::ALT_L,
        _ => return None,
    };
    Some(sym)
}
