use bankguard::frame::*;

#[test]
fn test_crc16_reference_vector() {
    let body = [0x01, 0x03, 0x00, 0x00, 0x00, 0x01];
    assert_eq!(crc16(&body), 0x0A84);
    // Sent low byte first
    assert_eq!(checksum(&body), [0x84, 0x0A]);
}

#[test]
fn test_request_encoding() {
    let request = ReadRequest::holding_registers(1, 0, 1);
    assert_eq!(request.encode(), [0x01, 0x03, 0x00, 0x00, 0x00, 0x01, 0x84, 0x0A]);
    assert!(verify(&request.encode()));

    let request = ReadRequest::holding_registers(2, 0x0010, 24);
    let frame = request.encode();
    assert_eq!(&frame[..6], &[0x02, 0x03, 0x00, 0x10, 0x00, 0x18]);
    assert_eq!(request.expected_response_len(), 3 + 48 + 2);
    assert_eq!(ReadRequest::decode(&frame), Ok(request));
}

#[test]
fn test_decode_signed_registers() {
    let request = ReadRequest::holding_registers(1, 0, 3);
    let frame = encode_response(&request, &[2512, -150, 0]).unwrap();
    assert_eq!(frame.len(), request.expected_response_len());
    assert_eq!(request.decode_response(&frame), Ok(vec![2512, -150, 0]));
}

#[test]
fn test_any_flipped_byte_is_rejected() {
    let request = ReadRequest::holding_registers(1, 0, 2);
    let frame = encode_response(&request, &[2500, 2600]).unwrap();

    for i in 0..frame.len() {
        let mut corrupted = frame.clone();
        corrupted[i] ^= 0x01;
        assert!(
            request.decode_response(&corrupted).is_err(),
            "corruption at byte {} went unnoticed",
            i
        );
    }

    let mut corrupted = frame.clone();
    corrupted[4] ^= 0xFF;
    assert!(matches!(
        request.decode_response(&corrupted),
        Err(FrameError::ChecksumMismatch { .. })
    ));
}

#[test]
fn test_short_response() {
    let request = ReadRequest::holding_registers(1, 0, 2);
    assert_eq!(
        request.decode_response(&[0x01, 0x03, 0x04]),
        Err(FrameError::ShortResponse { len: 3 })
    );
    assert_eq!(request.decode_response(&[]), Err(FrameError::ShortResponse { len: 0 }));
}

#[test]
fn test_wrong_unit() {
    let request = ReadRequest::holding_registers(1, 0, 1);
    let other = ReadRequest::holding_registers(5, 0, 1);
    let frame = encode_response(&other, &[2500]).unwrap();
    assert_eq!(
        request.decode_response(&frame),
        Err(FrameError::UnitMismatch { expected: 1, received: 5 })
    );
}

#[test]
fn test_device_exception() {
    let request = ReadRequest::holding_registers(3, 0, 8);
    let frame = encode_exception(&request, 0x02);
    assert_eq!(frame.len(), 5);
    assert_eq!(request.decode_response(&frame), Err(FrameError::DeviceException(0x02)));
}

#[test]
fn test_response_register_limit() {
    let request = ReadRequest::holding_registers(1, 0, 128);
    let full = vec![2500i16; MAX_RESPONSE_REGISTERS];
    let frame = encode_response(&request, &full).unwrap();
    assert_eq!(frame[2], 254);

    let over = vec![2500i16; MAX_RESPONSE_REGISTERS + 1];
    assert_eq!(encode_response(&request, &over), Err(FrameError::TooManyRegisters(128)));
}

#[test]
fn test_byte_count_mismatch() {
    // A well-formed frame carrying fewer registers than were asked for
    let asked = ReadRequest::holding_registers(1, 0, 4);
    let answered = ReadRequest::holding_registers(1, 0, 2);
    let frame = encode_response(&answered, &[2500, 2501]).unwrap();
    assert_eq!(
        asked.decode_response(&frame),
        Err(FrameError::ByteCountMismatch { expected: 8, received: 4 })
    );
}

#[test]
fn test_request_decode_rejects_bad_checksum() {
    let mut frame = ReadRequest::holding_registers(1, 0, 8).encode();
    frame[7] ^= 0x10;
    assert!(matches!(
        ReadRequest::decode(&frame),
        Err(FrameError::ChecksumMismatch { .. })
    ));
}
